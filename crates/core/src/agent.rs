use crate::error::AgentError;
use crate::llm::{extract_json_payload, parse_model_json, CompletionModel, CompletionRequest};
use crate::models::Confidence;
use crate::tools::ToolBox;
use crate::traits::KnowledgeGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnError, DefaultOnNull, OneOrMany};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_STEPS: usize = 8;

pub const MISSING_GRAPH_DISCLOSURE: &str = "The knowledge graph does not contain relevant information for this question, so this answer relies on general model knowledge.";

const AGENT_SYSTEM_PROMPT: &str = r#"You answer questions about one academic paper using a knowledge graph built from it.

Work in steps. Every reply is exactly one JSON object and nothing else:
- call a tool: {"action": "tool", "tool": "<tool name>", "arguments": {"<argument>": "<value>"}}
- finish: {"action": "final", "answer": {
    "query_type": "definition|purpose|mechanism|comparison|application|evaluation",
    "entities": ["..."], "core_definition": "...", "mechanisms": "...", "applications": "...",
    "answer": "...", "confidence": "high|medium|low", "citation": ["evidence text", "..."],
    "follow_up_questions": ["..."], "answer_type": "knowledge_store|llm_parametric", "tool_called": ["..."]}}

Call several tools before answering. Citations are evidence text returned by tools. If the graph lacks the information, say so explicitly and set answer_type to llm_parametric."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    #[default]
    KnowledgeStore,
    LlmParametric,
}

/// Structured final answer of the reasoning loop.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraphAnswer {
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub query_type: String,
    #[serde_as(deserialize_as = "DefaultOnError<DefaultOnNull<OneOrMany<_>>>")]
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub core_definition: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub mechanisms: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub applications: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub answer: String,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub confidence: Confidence,
    #[serde_as(deserialize_as = "DefaultOnError<DefaultOnNull<OneOrMany<_>>>")]
    #[serde(default)]
    pub citation: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError<DefaultOnNull<OneOrMany<_>>>")]
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default)]
    pub answer_type: AnswerType,
    #[serde_as(deserialize_as = "DefaultOnError<DefaultOnNull<OneOrMany<_>>>")]
    #[serde(default)]
    pub tool_called: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum AgentAction {
    Tool {
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    Final {
        answer: KnowledgeGraphAnswer,
    },
}

fn parse_action(reply: &str) -> Result<AgentAction, String> {
    let payload = extract_json_payload(reply).ok_or("reply contained no JSON object")?;
    parse_model_json(payload).map_err(|error| error.to_string())
}

/// Drives a completion model through the document's tools until it gives a
/// final answer.
pub struct ReasoningAgent<M, G> {
    model: M,
    toolbox: ToolBox<G>,
    max_steps: usize,
}

impl<M, G> ReasoningAgent<M, G>
where
    M: CompletionModel,
    G: KnowledgeGraph,
{
    pub fn new(model: M, toolbox: ToolBox<G>) -> Self {
        Self {
            model,
            toolbox,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn system_prompt(&self) -> String {
        let tools = serde_json::to_string_pretty(self.toolbox.specs()).unwrap_or_default();
        format!("{AGENT_SYSTEM_PROMPT}\n\nAvailable tools:\n{tools}")
    }

    pub async fn answer(&self, question: &str) -> Result<KnowledgeGraphAnswer, AgentError> {
        let system = self.system_prompt();
        let mut transcript: Vec<String> = Vec::new();
        let mut tools_called: Vec<String> = Vec::new();
        let mut grounded = false;
        let mut corrected = false;

        info!(document_id = self.toolbox.document_id(), question, "answering question");

        for step in 0..self.max_steps {
            let user = if transcript.is_empty() {
                format!("Question: {question}")
            } else {
                format!("Question: {question}\n\n{}", transcript.join("\n\n"))
            };
            let reply = self
                .model
                .complete(&CompletionRequest::new(system.as_str(), user))
                .await?;

            let action = match parse_action(&reply) {
                Ok(action) => action,
                Err(reason) if !corrected => {
                    warn!(step, %reason, "agent reply was not a valid action, asking again");
                    corrected = true;
                    transcript.push(format!(
                        "Your previous reply was not a valid action ({reason}). Reply with exactly one JSON object as described."
                    ));
                    continue;
                }
                Err(reason) => return Err(AgentError::InvalidReply(reason)),
            };

            match action {
                AgentAction::Tool { tool, arguments } => {
                    debug!(step, tool = %tool, "agent called tool");
                    let reply = self.toolbox.dispatch(&tool, &arguments).await;
                    grounded |= reply.found_content;
                    if !tools_called.contains(&tool) {
                        tools_called.push(tool.clone());
                    }
                    transcript.push(format!(
                        "Tool {tool} with arguments {arguments} returned:\n{}",
                        reply.text
                    ));
                }
                AgentAction::Final { mut answer } => {
                    answer.tool_called = tools_called;
                    if !grounded {
                        disclose_missing_grounding(&mut answer);
                    }
                    info!(
                        steps = step + 1,
                        grounded,
                        tools = answer.tool_called.len(),
                        "agent answered"
                    );
                    return Ok(answer);
                }
            }
        }

        Err(AgentError::StepLimit(self.max_steps))
    }
}

fn disclose_missing_grounding(answer: &mut KnowledgeGraphAnswer) {
    answer.answer_type = AnswerType::LlmParametric;
    if !answer.answer.starts_with(MISSING_GRAPH_DISCLOSURE) {
        answer.answer = if answer.answer.trim().is_empty() {
            MISSING_GRAPH_DISCLOSURE.to_string()
        } else {
            format!("{MISSING_GRAPH_DISCLOSURE}\n\n{}", answer.answer)
        };
    }
}
