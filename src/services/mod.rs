// 服务模块：聊天管线的各个环节。
pub mod agents;
pub mod analytics;
pub mod artifacts;
pub mod boutique;
pub mod filesystem;
pub mod intent;
pub mod llm;
pub mod mcp;
pub mod prompting;
pub mod safety;
