// 库入口：供集成测试与二进制共用。
pub mod api;
pub mod core;
pub mod services;
pub mod storage;

pub use self::api::build_router;
pub use self::core::{config, schemas, shutdown, state};
