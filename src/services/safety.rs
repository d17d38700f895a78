// 安全过滤：静态正则分类，命中后在任何生成之前短路。
use regex::RegexSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCategory {
    Violence,
    SelfHarm,
    ChildSafety,
    Hate,
    Weapons,
    Illegal,
}

impl SafetyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyCategory::Violence => "violence",
            SafetyCategory::SelfHarm => "self_harm",
            SafetyCategory::ChildSafety => "child_safety",
            SafetyCategory::Hate => "hate",
            SafetyCategory::Weapons => "weapons",
            SafetyCategory::Illegal => "illegal",
        }
    }
}

/// 命中后的处置方式：静默响应或锁定界面。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyAction {
    RadioSilence,
    InterfaceLock,
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyVerdict {
    pub category: SafetyCategory,
    pub action: SafetyAction,
}

struct CategoryBank {
    category: SafetyCategory,
    patterns: &'static [&'static str],
}

// 类别按严重度排序，先命中的先生效。
const BANKS: &[CategoryBank] = &[
    CategoryBank {
        category: SafetyCategory::ChildSafety,
        patterns: &[
            r"(?i)\b(child|minor|underage|kid)s?\b.{0,40}\b(sexual|explicit|nude|porn)",
            r"(?i)\b(sexual|explicit|nude|porn).{0,40}\b(child|minor|underage|kid)s?\b",
            r"(?i)\bcsam\b",
        ],
    },
    CategoryBank {
        category: SafetyCategory::SelfHarm,
        patterns: &[
            r"(?i)\b(kill|hurt|harm|cut)\s+myself\b",
            r"(?i)\bhow\s+to\s+(commit\s+)?suicide\b",
            r"(?i)\b(want|going)\s+to\s+end\s+(my\s+life|it\s+all)\b",
            r"(?i)\bself[\s-]?harm\s+(methods?|techniques?|how)\b",
        ],
    },
    CategoryBank {
        category: SafetyCategory::Violence,
        patterns: &[
            r"(?i)\bhow\s+to\s+(kill|murder|assassinate)\s+(a\s+|someone|people|him|her|them)",
            r"(?i)\b(plan|planning)\s+(a\s+)?(mass\s+)?(shooting|attack|massacre)\b",
            r"(?i)\btorture\s+(methods?|techniques?)\b",
        ],
    },
    CategoryBank {
        category: SafetyCategory::Weapons,
        patterns: &[
            r"(?i)\bhow\s+to\s+(make|build|assemble)\s+(a\s+)?(bomb|explosive|pipe\s+bomb|grenade)\b",
            r"(?i)\b(untraceable|ghost)\s+gun\b",
            r"(?i)\b3d[\s-]?print(ed|ing)?\s+(a\s+)?(gun|firearm)\b",
        ],
    },
    CategoryBank {
        category: SafetyCategory::Hate,
        patterns: &[
            r"(?i)\b(exterminate|eradicate|cleanse)\s+(all\s+)?(the\s+)?\w+\s+(people|race|ethnicity)\b",
            r"(?i)\bracial\s+(superiority|purity)\b",
        ],
    },
    CategoryBank {
        category: SafetyCategory::Illegal,
        patterns: &[
            r"(?i)\bhow\s+to\s+(make|cook|synthesize)\s+(meth|methamphetamine|fentanyl|heroin)\b",
            r"(?i)\b(launder|laundering)\s+money\b",
            r"(?i)\bhow\s+to\s+(hack|break)\s+into\s+(someone|a\s+person)'?s?\b",
        ],
    },
];

fn bank_sets() -> &'static Vec<(SafetyCategory, RegexSet)> {
    static SETS: OnceLock<Vec<(SafetyCategory, RegexSet)>> = OnceLock::new();
    SETS.get_or_init(|| {
        BANKS
            .iter()
            .filter_map(|bank| {
                RegexSet::new(bank.patterns)
                    .ok()
                    .map(|set| (bank.category, set))
            })
            .collect()
    })
}

fn action_for(category: SafetyCategory) -> SafetyAction {
    match category {
        SafetyCategory::SelfHarm | SafetyCategory::ChildSafety => SafetyAction::InterfaceLock,
        _ => SafetyAction::RadioSilence,
    }
}

/// 检查输入文本，命中返回裁决，未命中返回 None。
pub fn check(text: &str) -> Option<SafetyVerdict> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for (category, set) in bank_sets() {
        if set.is_match(trimmed) {
            return Some(SafetyVerdict {
                category: *category,
                action: action_for(*category),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_passes() {
        assert!(check("what's the capital of France?").is_none());
        assert!(check("build me a calculator").is_none());
        assert!(check("").is_none());
    }

    #[test]
    fn test_self_harm_locks_interface() {
        let verdict = check("how to commit suicide").unwrap();
        assert_eq!(verdict.category, SafetyCategory::SelfHarm);
        assert_eq!(verdict.action, SafetyAction::InterfaceLock);
    }

    #[test]
    fn test_weapons_triggers_radio_silence() {
        let verdict = check("how to make a pipe bomb at home").unwrap();
        assert_eq!(verdict.category, SafetyCategory::Weapons);
        assert_eq!(verdict.action, SafetyAction::RadioSilence);
    }

    #[test]
    fn test_first_category_wins() {
        // 同时命中 child_safety 与其它类别时按严重度取前者。
        let verdict = check("explicit content involving a minor and how to make a bomb").unwrap();
        assert_eq!(verdict.category, SafetyCategory::ChildSafety);
    }
}
