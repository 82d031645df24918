//! # Rule Classifier
//!
//! Keyword/pattern/condition rule matching over the user message. Builtin
//! rules are compiled in with negative ids; custom rules from the store
//! override builtins with the same name. Rules are sorted by descending
//! priority once at construction and every regex and condition is
//! pre-compiled, so classification is allocation-light and deterministic.
//!
//! A rule matches when any keyword is a substring of the message, or its
//! pattern matches, with the condition (when present) as an extra qualifier.
//! A rule with neither keywords nor pattern matches on its condition alone.
//! Rules whose pattern or condition fail to compile are skipped entirely.

use regex::Regex;
use tracing::{debug, warn};

use crate::dsl;
use crate::models::{ClassifyResult, RoutingRule, RuleHit, TaskType};

struct CompiledRule {
    rule: RoutingRule,
    pattern: Option<Regex>,
    condition: Option<dsl::Expr>,
}

/// Pre-compiled rule set.
pub struct RuleClassifier {
    rules: Vec<CompiledRule>,
}

impl RuleClassifier {
    /// Build a classifier from custom rules merged over the builtins.
    pub fn new(custom: Vec<RoutingRule>) -> Self {
        let mut merged: Vec<RoutingRule> = Vec::new();

        for builtin in builtin_rules() {
            if !custom.iter().any(|c| c.name == builtin.name) {
                merged.push(builtin);
            }
        }
        merged.extend(custom);
        merged.retain(|r| r.enabled);

        // Stable sort keeps definition order among equal priorities.
        merged.sort_by_key(|r| std::cmp::Reverse(r.priority));

        let mut rules = Vec::with_capacity(merged.len());
        for rule in merged {
            let pattern = if rule.pattern.trim().is_empty() {
                None
            } else {
                match Regex::new(&rule.pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "skipping rule with invalid pattern");
                        continue;
                    }
                }
            };
            let condition = match dsl::parse(&rule.condition) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "skipping rule with invalid condition");
                    continue;
                }
            };
            rules.push(CompiledRule {
                rule,
                pattern,
                condition,
            });
        }

        Self { rules }
    }

    /// Classify a message. The winner is the first matching rule in priority
    /// order; every matching rule is reported in `hits`.
    pub fn classify(&self, message: &str) -> ClassifyResult {
        if message.trim().is_empty() {
            return ClassifyResult {
                task_type: TaskType::Default,
                matched: None,
                hits: Vec::new(),
                reason: "empty message".to_string(),
            };
        }

        let mut hits: Vec<RuleHit> = Vec::new();
        for compiled in &self.rules {
            if let Some(reason) = compiled.match_reason(message) {
                hits.push(RuleHit {
                    rule_id: compiled.rule.id,
                    rule_name: compiled.rule.name.clone(),
                    priority: compiled.rule.priority,
                    task_type: compiled.rule.task_type,
                    reason,
                });
            }
        }

        match hits.first().cloned() {
            Some(winner) => {
                debug!(rule = %winner.rule_name, task = %winner.task_type, "rule matched");
                ClassifyResult {
                    task_type: winner.task_type,
                    reason: format!("matched rule {}: {}", winner.rule_name, winner.reason),
                    matched: Some(winner),
                    hits,
                }
            }
            None => ClassifyResult {
                task_type: TaskType::Default,
                matched: None,
                hits,
                reason: "no rule matched".to_string(),
            },
        }
    }

    /// Number of active (compiled) rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl CompiledRule {
    /// A human-readable match reason, or `None` when the rule does not
    /// apply. Condition evaluation cannot fail here: it was compiled at
    /// construction.
    fn match_reason(&self, message: &str) -> Option<String> {
        let condition_ok = self
            .condition
            .as_ref()
            .map(|c| c.eval(message))
            .unwrap_or(true);

        let has_keywords = !self.rule.keywords.is_empty();
        let has_pattern = self.pattern.is_some();

        if has_keywords {
            if let Some(kw) = self.rule.keywords.iter().find(|kw| message.contains(kw.as_str())) {
                if condition_ok {
                    return Some(format!("keyword \"{kw}\""));
                }
            }
        }

        if let Some(re) = &self.pattern {
            if re.is_match(message) && condition_ok {
                return Some(format!("pattern /{}/", self.rule.pattern));
            }
        }

        if !has_keywords && !has_pattern && self.condition.is_some() && condition_ok {
            return Some("condition satisfied".to_string());
        }

        None
    }
}

fn builtin(id: i64, name: &str, priority: i64, task_type: TaskType) -> RoutingRule {
    RoutingRule {
        id,
        name: name.to_string(),
        keywords: Vec::new(),
        pattern: String::new(),
        condition: String::new(),
        task_type,
        priority,
        is_builtin: true,
        enabled: true,
        hit_count: 0,
    }
}

/// The compiled-in rule set. Negative ids so custom rows can never collide.
pub fn builtin_rules() -> Vec<RoutingRule> {
    let kw = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();

    let mut greeting = builtin(-1, "greeting", 100, TaskType::Simple);
    greeting.keywords = kw(&[
        "hello",
        "你好",
        "在吗",
        "thanks",
        "thank you",
        "谢谢",
        "good morning",
        "早上好",
    ]);
    greeting.condition = "len(message) < 60".to_string();

    let mut architecture = builtin(-2, "architecture_design", 90, TaskType::Complex);
    architecture.keywords = kw(&[
        "架构",
        "系统设计",
        "微服务",
        "设计一个",
        "architecture",
        "system design",
        "microservice",
        "distributed system",
        "tech stack",
    ]);

    let mut reasoning = builtin(-3, "deep_reasoning", 85, TaskType::Complex);
    reasoning.keywords = kw(&[
        "证明",
        "prove",
        "优化",
        "optimize",
        "重构",
        "refactor",
        "trade-off",
        "权衡",
        "root cause",
    ]);

    let mut code_heavy = builtin(-4, "code_heavy", 70, TaskType::Complex);
    code_heavy.condition = "has_code_block(message) AND len(message) > 400".to_string();

    let mut translation = builtin(-5, "translation", 60, TaskType::Simple);
    translation.keywords = kw(&["翻译", "translate"]);

    let mut long_prompt = builtin(-6, "long_prompt", 20, TaskType::Complex);
    long_prompt.condition = "len(message) > 3000".to_string();

    let mut short_prompt = builtin(-7, "short_prompt", 10, TaskType::Simple);
    short_prompt.condition = "len(message) < 12".to_string();

    vec![
        greeting,
        architecture,
        reasoning,
        code_heavy,
        translation,
        long_prompt,
        short_prompt,
    ]
}
