use crate::citations::resolve_citations;
use crate::embeddings::Embedder;
use crate::error::ChatError;
use crate::index::VectorIndex;
use crate::llm::{ChatMessage, LanguageModel};
use crate::models::{Citation, RetrievalResult};
use crate::search::{self, clears_relevance_floor};
use crate::session::ChatSession;
use crate::transient::TransientContext;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_MAX_STEPS: usize = 6;

const EVIDENCE_SNIPPET_CHARS: usize = 700;

const NO_EVIDENCE_ANSWER: &str = "I could not find supporting evidence for this in the indexed \
case sheets or the attached document, so I cannot answer it reliably.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub top_k: usize,
}

impl AgentConfig {
    pub fn with_top_k(top_k: usize) -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            top_k: top_k.clamp(1, search::MAX_TOP_K),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::with_top_k(search::DEFAULT_TOP_K)
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub incomplete: bool,
}

/// The loop's explicit states. Transitions only ever follow
/// `Deciding -> (Retrieving | LookingUpTransient) -> Deciding` or
/// `Deciding -> Answering -> Done`, which keeps the step bound and the
/// grounding checks structural rather than advisory.
#[derive(Debug)]
enum AgentState {
    Deciding,
    Retrieving { query: String },
    LookingUpTransient { query: String },
    Answering { draft: String },
    Done(AgentOutcome),
}

#[derive(Debug, PartialEq)]
enum Decision {
    Retrieve { query: String },
    LookupTransient { query: String },
    Final { answer: String },
}

#[derive(Deserialize)]
struct DecisionEnvelope {
    action: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// One bounded tool-use loop per chat request: the model either gathers
/// evidence or answers, and every substantive answer must rest on at least
/// one gathering step.
pub struct ReasoningAgent<'a> {
    model: &'a dyn LanguageModel,
    index: &'a VectorIndex,
    embedder: &'a dyn Embedder,
    config: AgentConfig,
}

impl<'a> ReasoningAgent<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        index: &'a VectorIndex,
        embedder: &'a dyn Embedder,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            index,
            embedder,
            config,
        }
    }

    pub async fn answer(
        &self,
        session: &mut ChatSession,
        message: &str,
        transient: Option<&TransientContext>,
    ) -> Result<AgentOutcome, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let mut conversation = Vec::new();
        conversation.push(ChatMessage::system(system_prompt(transient.is_some())));
        conversation.extend(session.turns.iter().cloned());
        conversation.push(ChatMessage::user(message));

        let mut evidence: Vec<Vec<RetrievalResult>> = Vec::new();
        let mut forced_retrieval = false;
        let mut steps = 0usize;
        let mut state = AgentState::Deciding;

        let outcome = loop {
            state = match state {
                AgentState::Done(outcome) => break outcome,
                _ if steps >= self.config.max_steps => {
                    break self.forced_completion(&conversation, &evidence).await?;
                }
                AgentState::Deciding => {
                    steps += 1;
                    let raw = self.model.complete(&conversation).await?;
                    match parse_decision(&raw) {
                        Ok(Decision::Retrieve { query }) => AgentState::Retrieving { query },
                        Ok(Decision::LookupTransient { query }) if transient.is_some() => {
                            AgentState::LookingUpTransient { query }
                        }
                        Ok(Decision::LookupTransient { .. }) => {
                            conversation.push(ChatMessage::system(
                                "No document is attached to this request. Use retrieve or final.",
                            ));
                            AgentState::Deciding
                        }
                        Ok(Decision::Final { answer }) => {
                            if evidence.is_empty()
                                && !forced_retrieval
                                && requires_evidence(message)
                            {
                                // Grounding policy: substantive questions get
                                // at least one retrieval before any answer.
                                forced_retrieval = true;
                                debug!("forcing a retrieval before an ungrounded answer");
                                AgentState::Retrieving {
                                    query: message.to_string(),
                                }
                            } else {
                                AgentState::Answering { draft: answer }
                            }
                        }
                        Err(problem) => {
                            conversation.push(ChatMessage::system(format!(
                                "That was not a valid decision ({problem}). Reply with exactly \
                                 one JSON object as instructed."
                            )));
                            AgentState::Deciding
                        }
                    }
                }
                AgentState::Retrieving { query } => {
                    let hits = self.retrieve(&query, transient)?;
                    conversation.push(ChatMessage::system(format_evidence(
                        "the indexed case sheets",
                        &query,
                        &hits,
                    )));
                    evidence.push(hits);
                    AgentState::Deciding
                }
                AgentState::LookingUpTransient { query } => {
                    let hits = match transient {
                        Some(context) => self.lookup_transient(context, &query)?,
                        None => Vec::new(),
                    };
                    conversation.push(ChatMessage::system(format_evidence(
                        "the attached document",
                        &query,
                        &hits,
                    )));
                    evidence.push(hits);
                    AgentState::Deciding
                }
                AgentState::Answering { draft } => {
                    let grounded = evidence.iter().any(|batch| clears_relevance_floor(batch));
                    if !grounded && requires_evidence(message) {
                        AgentState::Done(AgentOutcome {
                            answer: NO_EVIDENCE_ANSWER.to_string(),
                            citations: Vec::new(),
                            incomplete: false,
                        })
                    } else {
                        AgentState::Done(AgentOutcome {
                            answer: draft,
                            citations: resolve_citations(&evidence, search::MIN_RELEVANCE),
                            incomplete: false,
                        })
                    }
                }
            };
        };

        session.record_exchange(message, &outcome.answer);
        Ok(outcome)
    }

    /// Pooled retrieval: persisted hits and, when an upload is present,
    /// transient hits re-ranked together by score into one list.
    fn retrieve(
        &self,
        query: &str,
        transient: Option<&TransientContext>,
    ) -> Result<Vec<RetrievalResult>, ChatError> {
        let query_vector = self
            .embedder
            .embed(query)
            .map_err(|error| ChatError::Retrieval(error.to_string()))?;

        let mut hits = self.index.query(&query_vector, self.config.top_k);
        if let Some(context) = transient {
            let transient_hits = context.query(&query_vector, self.config.top_k);
            hits = search::merge_ranked(hits, transient_hits, self.config.top_k);
        }
        Ok(hits)
    }

    fn lookup_transient(
        &self,
        context: &TransientContext,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, ChatError> {
        let query_vector = self
            .embedder
            .embed(query)
            .map_err(|error| ChatError::Retrieval(error.to_string()))?;
        Ok(context.query(&query_vector, self.config.top_k))
    }

    /// Step budget exhausted: one plain-text completion over whatever
    /// evidence is already on the table, flagged incomplete.
    async fn forced_completion(
        &self,
        conversation: &[ChatMessage],
        evidence: &[Vec<RetrievalResult>],
    ) -> Result<AgentOutcome, ChatError> {
        let mut messages = conversation.to_vec();
        messages.push(ChatMessage::system(
            "Step budget exhausted. Give your best final answer now as plain text, using only \
             the evidence already shown. Do not reply with JSON.",
        ));

        let answer = self.model.complete(&messages).await?;
        Ok(AgentOutcome {
            answer: answer.trim().to_string(),
            citations: resolve_citations(evidence, search::MIN_RELEVANCE),
            incomplete: true,
        })
    }
}

fn system_prompt(has_transient: bool) -> String {
    let mut prompt = String::from(
        "You are a legal case assistant. Ground every factual claim about a case in passages \
         retrieved from the indexed case sheets or from the user's attached document. Never \
         invent case facts.\n\
         Reply with exactly one JSON object per turn and nothing else:\n\
         {\"action\": \"retrieve\", \"query\": \"<focused search query>\"} \
         searches the indexed case sheets.\n",
    );
    if has_transient {
        prompt.push_str(
            "{\"action\": \"lookup_transient\", \"query\": \"<focused search query>\"} \
             searches only the document the user attached to this request.\n",
        );
    }
    prompt.push_str(
        "{\"action\": \"final\", \"answer\": \"<your answer>\"} finishes the turn.\n\
         Search before answering any question about case facts, and refine the query and search \
         again when the first results are thin. If the evidence shown does not support an \
         answer, say so plainly instead of guessing. Cite facts inline like (filename p.3). \
         Keep answers concise, with bullet points where they help.",
    );
    prompt
}

fn parse_decision(raw: &str) -> Result<Decision, String> {
    let value = extract_json_object(raw)?;
    let envelope: DecisionEnvelope =
        serde_json::from_value(value).map_err(|error| error.to_string())?;

    let query = envelope
        .query
        .filter(|value| !value.trim().is_empty());
    let answer = envelope
        .answer
        .filter(|value| !value.trim().is_empty());

    match envelope.action.trim().to_lowercase().as_str() {
        "retrieve" => query
            .map(|query| Decision::Retrieve { query })
            .ok_or_else(|| "retrieve requires a query field".to_string()),
        "lookup_transient" => query
            .map(|query| Decision::LookupTransient { query })
            .ok_or_else(|| "lookup_transient requires a query field".to_string()),
        "final" => answer
            .map(|answer| Decision::Final { answer })
            .ok_or_else(|| "final requires an answer field".to_string()),
        other => Err(format!("unknown action: {other}")),
    }
}

fn extract_json_object(raw: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(value);
    }

    // Models wrap JSON in prose or fences often enough to be worth a salvage.
    let start = raw
        .find('{')
        .ok_or_else(|| "no JSON object in model output".to_string())?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| "no JSON object in model output".to_string())?;
    serde_json::from_str::<Value>(&raw[start..=end])
        .map_err(|error| format!("malformed JSON decision: {error}"))
}

fn format_evidence(source: &str, query: &str, hits: &[RetrievalResult]) -> String {
    if hits.is_empty() {
        return format!("No passages found in {source} for \"{query}\".");
    }

    let mut out = format!("Passages from {source} for \"{query}\":");
    for hit in hits {
        let snippet: String = hit.passage.text.chars().take(EVIDENCE_SNIPPET_CHARS).collect();
        out.push_str(&format!(
            "\n[{} p.{} score={:.3}] {}",
            hit.passage.filename, hit.passage.page, hit.score, snippet
        ));
    }
    out
}

const SMALLTALK: [&str; 14] = [
    "hi",
    "hello",
    "hey",
    "thanks",
    "thank you",
    "good morning",
    "good afternoon",
    "good evening",
    "how are you",
    "bye",
    "goodbye",
    "ok",
    "okay",
    "who are you",
];

/// Purely conversational turns are the only ones allowed to finish without
/// a gathering step.
fn requires_evidence(message: &str) -> bool {
    let lowered = message.trim().to_lowercase();
    let stripped = lowered.trim_end_matches(['!', '.', '?', ',']).trim();
    !SMALLTALK.contains(&stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::index::VectorIndex;
    use crate::models::{IngestionOptions, Passage};
    use crate::transient::TransientContext;
    use std::sync::Mutex;

    /// Scripted model: returns queued replies in order, records every
    /// conversation it was shown.
    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn observed(&self) -> Vec<Vec<ChatMessage>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ChatError::ModelUnavailable("script exhausted".to_string()))
        }
    }

    fn embedded_passage(
        embedder: &CharacterNgramEmbedder,
        id: &str,
        filename: &str,
        page: u32,
        text: &str,
    ) -> Passage {
        Passage {
            passage_id: id.to_string(),
            document_id: filename.to_string(),
            filename: filename.to_string(),
            page,
            passage_index: 0,
            text: text.to_string(),
            embedding: embedder.embed(text).unwrap(),
        }
    }

    fn contract_index(embedder: &CharacterNgramEmbedder) -> VectorIndex {
        VectorIndex::from_passages(
            vec![
                embedded_passage(
                    embedder,
                    "a1",
                    "contract_case.pdf",
                    1,
                    "The claimant seeks damages for breach of a supply contract signed in March.",
                ),
                embedded_passage(
                    embedder,
                    "b1",
                    "traffic_case.pdf",
                    1,
                    "The defendant drove through the intersection against the signal at night.",
                ),
            ],
            embedder,
        )
        .unwrap()
    }

    fn empty_index(embedder: &CharacterNgramEmbedder) -> VectorIndex {
        VectorIndex::from_passages(Vec::new(), embedder).unwrap()
    }

    #[tokio::test]
    async fn retrieve_then_final_yields_cited_answer() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let model = ScriptedModel::new(&[
            r#"{"action": "retrieve", "query": "breach of supply contract damages"}"#,
            r#"{"action": "final", "answer": "The claimant seeks contract damages (contract_case.pdf p.1)."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::with_top_k(3));
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "What damages does the claimant seek?", None)
            .await
            .unwrap();

        assert!(!outcome.incomplete);
        assert!(outcome.answer.contains("contract damages"));
        assert!(!outcome.citations.is_empty());
        assert_eq!(outcome.citations[0].filename, "contract_case.pdf");
        assert_eq!(outcome.citations[0].page, 1);
        assert!(outcome.citations.len() <= 3);
        // The exchange landed in the session history.
        assert_eq!(session.turns.len(), 2);
    }

    #[tokio::test]
    async fn the_top_citation_matches_the_best_scoring_document() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let model = ScriptedModel::new(&[
            r#"{"action": "retrieve", "query": "breach of a supply contract signed in March"}"#,
            r#"{"action": "final", "answer": "Contract breach case."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::with_top_k(2));
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "Tell me about the supply contract breach.", None)
            .await
            .unwrap();

        assert_eq!(outcome.citations[0].filename, "contract_case.pdf");
        if let Some(second) = outcome.citations.get(1) {
            assert!(outcome.citations[0].score > second.score);
        }
    }

    #[tokio::test]
    async fn an_ungrounded_final_forces_one_retrieval_first() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let model = ScriptedModel::new(&[
            r#"{"action": "final", "answer": "Premature answer."}"#,
            r#"{"action": "final", "answer": "Grounded answer about the supply contract."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::with_top_k(3));
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "What does the supply contract case claim?", None)
            .await
            .unwrap();

        // The second decision saw the forced retrieval's evidence.
        let observed = model.observed();
        assert_eq!(observed.len(), 2);
        assert!(observed[1]
            .iter()
            .any(|message| message.content.starts_with("Passages from")));
        assert!(!outcome.citations.is_empty());
    }

    #[tokio::test]
    async fn smalltalk_needs_no_evidence() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let model = ScriptedModel::new(&[r#"{"action": "final", "answer": "Hello! How can I help with your case?"}"#]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::default());
        let mut session = ChatSession::default();
        let outcome = agent.answer(&mut session, "Hello!", None).await.unwrap();

        assert!(outcome.citations.is_empty());
        assert!(!outcome.incomplete);
        assert_eq!(model.observed().len(), 1);
    }

    #[tokio::test]
    async fn no_evidence_above_the_floor_means_an_honest_refusal() {
        let embedder = CharacterNgramEmbedder::default();
        let index = empty_index(&embedder);
        let model = ScriptedModel::new(&[
            r#"{"action": "retrieve", "query": "unrelated question"}"#,
            r#"{"action": "final", "answer": "Made-up answer."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::default());
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "What did the witness testify?", None)
            .await
            .unwrap();

        assert!(outcome.citations.is_empty());
        assert!(outcome.answer.contains("could not find supporting evidence"));
        assert!(!outcome.incomplete);
    }

    #[tokio::test]
    async fn hitting_the_step_budget_degrades_to_an_incomplete_answer() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        // Six malformed decisions burn the budget, then the forced plain-text
        // completion.
        let model = ScriptedModel::new(&[
            "not json",
            "not json",
            "not json",
            "not json",
            "not json",
            "not json",
            "Best-effort summary of what is known so far.",
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::default());
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "What damages does the claimant seek?", None)
            .await
            .unwrap();

        assert!(outcome.incomplete);
        assert_eq!(outcome.answer, "Best-effort summary of what is known so far.");
    }

    #[tokio::test]
    async fn transient_lookup_grounds_answers_in_the_upload() {
        let embedder = CharacterNgramEmbedder::default();
        let index = empty_index(&embedder);
        let transient = TransientContext::from_raw_text(
            "The tenant withheld rent after the landlord ignored repair notices for months.",
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();

        let model = ScriptedModel::new(&[
            r#"{"action": "lookup_transient", "query": "tenant withheld rent repair notices"}"#,
            r#"{"action": "final", "answer": "The tenant withheld rent over ignored repairs (user_document p.1)."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::with_top_k(3));
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "Why did the tenant withhold rent?", Some(&transient))
            .await
            .unwrap();

        assert!(!outcome.citations.is_empty());
        assert_eq!(outcome.citations[0].filename, "user_document");
        assert_eq!(outcome.citations[0].page, 1);
    }

    #[tokio::test]
    async fn retrieval_pools_transient_hits_with_the_index() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let transient = TransientContext::from_raw_text(
            "The claimant seeks damages for breach of a supply contract signed in March.",
            &embedder,
            &IngestionOptions::default(),
        )
        .unwrap();

        let model = ScriptedModel::new(&[
            r#"{"action": "retrieve", "query": "breach of a supply contract damages"}"#,
            r#"{"action": "final", "answer": "Both sources describe the contract claim."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::with_top_k(4));
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(
                &mut session,
                "What does the supply contract case claim?",
                Some(&transient),
            )
            .await
            .unwrap();

        let filenames: Vec<_> = outcome
            .citations
            .iter()
            .map(|citation| citation.filename.as_str())
            .collect();
        assert!(filenames.contains(&"contract_case.pdf"));
        assert!(filenames.contains(&"user_document"));
    }

    #[tokio::test]
    async fn lookup_without_an_attachment_is_corrected() {
        let embedder = CharacterNgramEmbedder::default();
        let index = contract_index(&embedder);
        let model = ScriptedModel::new(&[
            r#"{"action": "lookup_transient", "query": "anything"}"#,
            r#"{"action": "retrieve", "query": "supply contract breach"}"#,
            r#"{"action": "final", "answer": "Answer from the case sheets."}"#,
        ]);

        let agent = ReasoningAgent::new(&model, &index, &embedder, AgentConfig::default());
        let mut session = ChatSession::default();
        let outcome = agent
            .answer(&mut session, "What does the contract case claim?", None)
            .await
            .unwrap();

        assert!(!outcome.citations.is_empty());
        let observed = model.observed();
        assert!(observed[1]
            .iter()
            .any(|message| message.content.contains("No document is attached")));
    }

    #[test]
    fn decisions_parse_from_noisy_output() {
        let decision = parse_decision(
            "Sure, here is my decision:\n```json\n{\"action\": \"retrieve\", \"query\": \"lease terms\"}\n```",
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::Retrieve {
                query: "lease terms".to_string()
            }
        );

        assert!(parse_decision("no object here").is_err());
        assert!(parse_decision(r#"{"action": "retrieve"}"#).is_err());
        assert!(parse_decision(r#"{"action": "dance"}"#).is_err());
    }

    #[test]
    fn conversational_turns_are_detected() {
        assert!(!requires_evidence("hello"));
        assert!(!requires_evidence("  Thanks!  "));
        assert!(requires_evidence("What did the court order?"));
        assert!(requires_evidence("hello, what does clause 4 say"));
    }
}
