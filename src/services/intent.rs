// 意图分析：按序关键词/正则判定构建、调研或歧义。
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default)]
pub struct IntentAnalysis {
    pub needs_research: bool,
    pub needs_building: bool,
    pub is_ambiguous: bool,
    pub reasoning: String,
}

fn negation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(don'?t|do\s+not|no\s+need\s+to|without)\s+(build|creat|mak)(e|ing)?\w*",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn build_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(build|create|make|generate|code)\s+(me\s+)?.{0,40}?\b(tool|app|calculator|timer|converter|tracker|counter|picker|widget|game|page|form|dashboard)s?\b",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn research_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(research|find\s+out|look\s+up|latest|compare|what'?s\s+happening\s+with|investigate|dig\s+into)\b",
        )
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

fn hedge_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(maybe|not\s+sure|something\s+like|kind\s+of|i\s+think\s+i\s+want)\b")
            .unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

/// 分析单条用户消息的意图。纯函数，无外部调用。
pub fn analyze_request(message: &str) -> IntentAnalysis {
    let text = message.trim();
    if text.is_empty() {
        return IntentAnalysis {
            reasoning: "empty message".to_string(),
            ..Default::default()
        };
    }

    let negated = negation_regex().is_match(text);
    let wants_build = !negated && build_regex().is_match(text);
    let wants_research = research_regex().is_match(text);
    let hedged = hedge_regex().is_match(text);

    // 措辞含糊时交给澄清分支；调研+构建同时命中走链式分支，不算歧义。
    let is_ambiguous = hedged && (wants_build || wants_research);

    let reasoning = if is_ambiguous {
        "hedged phrasing, needs clarification".to_string()
    } else if wants_build && wants_research {
        "research then build chain".to_string()
    } else if wants_build {
        "build-tool phrasing detected".to_string()
    } else if wants_research {
        "research phrasing detected".to_string()
    } else if negated {
        "build phrasing explicitly negated".to_string()
    } else {
        "no tool or research signal, direct conversation".to_string()
    };

    IntentAnalysis {
        needs_research: wants_research && !is_ambiguous,
        needs_building: wants_build && !is_ambiguous,
        is_ambiguous,
        reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_me_a_calculator() {
        let intent = analyze_request("build me a calculator");
        assert!(intent.needs_building);
        assert!(!intent.needs_research);
        assert!(!intent.is_ambiguous);
    }

    #[test]
    fn test_negation_clears_build() {
        let intent = analyze_request("don't build a tool, just explain how timers work");
        assert!(!intent.needs_building);
    }

    #[test]
    fn test_research_keywords() {
        let intent = analyze_request("what's happening with rust async runtimes lately");
        assert!(intent.needs_research);
        assert!(!intent.needs_building);
    }

    #[test]
    fn test_research_then_build_is_both() {
        let intent =
            analyze_request("research the latest pomodoro techniques and build me a timer app");
        assert!(intent.needs_research);
        assert!(intent.needs_building);
        assert!(!intent.is_ambiguous);
    }

    #[test]
    fn test_hedged_build_is_ambiguous() {
        let intent = analyze_request("maybe build me some kind of tracker app, not sure");
        assert!(intent.is_ambiguous);
        assert!(!intent.needs_building);
    }

    #[test]
    fn test_plain_chat_is_direct() {
        let intent = analyze_request("how was your day?");
        assert!(!intent.needs_building);
        assert!(!intent.needs_research);
        assert!(!intent.is_ambiguous);
    }
}
