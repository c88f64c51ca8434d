use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Code,
    Analysis,
    Research,
    Chat,
}

impl TaskCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Analysis => "analysis",
            Self::Research => "research",
            Self::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub keywords: Vec<String>,
    pub category: TaskCategory,
    pub tools: Vec<String>,
}

impl ClassificationRule {
    pub fn new(category: TaskCategory, keywords: &[&str], tools: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            category,
            tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn matched_keyword(&self, message: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|keyword| message.contains(keyword.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskClassification {
    pub task_type: TaskCategory,
    pub confidence: f64,
    pub mcp_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_keyword: Option<String>,
}

/// Ordered keyword rules; the first rule with a matching keyword wins.
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    rules: Vec<ClassificationRule>,
    confidence: f64,
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self::new(vec![
            ClassificationRule::new(
                TaskCategory::Code,
                &["code", "function", "debug", "refactor"],
                &["code_assistant", "document_processor"],
            ),
            ClassificationRule::new(
                TaskCategory::Analysis,
                &["analyze", "research", "compare", "evaluate"],
                &["web_research", "document_processor"],
            ),
            ClassificationRule::new(
                TaskCategory::Research,
                &["search", "find", "lookup"],
                &["web_research"],
            ),
        ])
    }
}

impl TaskClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self {
            rules,
            confidence: 0.8,
        }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, message: &str) -> TaskClassification {
        let message = message.to_lowercase();
        for rule in &self.rules {
            if let Some(keyword) = rule.matched_keyword(&message) {
                return TaskClassification {
                    task_type: rule.category,
                    confidence: self.confidence,
                    mcp_tools: rule.tools.clone(),
                    matched_keyword: Some(keyword.to_string()),
                };
            }
        }

        TaskClassification {
            task_type: TaskCategory::Chat,
            confidence: self.confidence,
            mcp_tools: Vec::new(),
            matched_keyword: None,
        }
    }
}
