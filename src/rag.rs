//! Query rewriting and multi-hop question answering.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::Passage;
use crate::providers::{ChatModel, PromptMessage};
use crate::retrieval::PassageRetriever;

pub const ANALYSIS_FALLBACK_ANSWER: &str =
    "Unable to parse multi-hop analysis. Proceeding with direct answer.";

const REWRITE_SYSTEM_PROMPT: &str = "You are a query rewriting assistant. Your task is to improve medical queries for better information retrieval.

Given a user's question, rewrite it to:
1. Be more specific and clear
2. Include relevant medical terminology
3. Break down complex questions into key concepts
4. Maintain the original intent

Return ONLY the rewritten query, nothing else.";

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a medical reasoning assistant. Analyze the retrieved context and decide whether the question can be answered directly or needs intermediate sub-questions first.

Reply with a single JSON object and nothing else, in one of these shapes:
{"type": "direct", "answer": "<answer grounded in the context>"}
{"type": "multi_hop", "sub_questions": ["<sub-question 1>", "<sub-question 2>"]}"#;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a medical assistant. Synthesize information from multiple sources to answer the user's question comprehensively.

Use all the provided context to give a complete, accurate answer. Cite which parts of the context support your answer.";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Analysis {
    Direct { answer: String },
    MultiHop { sub_questions: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct MultiHopOutcome {
    pub answer: String,
    pub reasoning_chain: Vec<String>,
    pub context_used: Vec<Passage>,
}

pub async fn rewrite_query(llm: &dyn ChatModel, question: &str) -> Result<String> {
    let messages = [
        PromptMessage::system(REWRITE_SYSTEM_PROMPT),
        PromptMessage::user(format!("Original query: {question}\n\nRewritten query:")),
    ];

    let rewritten = llm
        .complete(&messages)
        .await
        .context("query rewrite failed")?;
    Ok(rewritten.trim().to_string())
}

pub async fn analyze_query_complexity(
    llm: &dyn ChatModel,
    question: &str,
    context: &str,
) -> Result<Analysis> {
    let messages = [
        PromptMessage::system(ANALYSIS_SYSTEM_PROMPT),
        PromptMessage::user(format!(
            "Question: {question}\n\nContext: {context}\n\nAnalysis:"
        )),
    ];

    let reply = llm
        .complete(&messages)
        .await
        .context("query analysis failed")?;

    Ok(parse_analysis(&reply))
}

fn parse_analysis(reply: &str) -> Analysis {
    match serde_json::from_str::<Analysis>(strip_code_fences(reply)) {
        Ok(Analysis::MultiHop { sub_questions }) if sub_questions.is_empty() => {
            tracing::warn!("multi-hop analysis listed no sub-questions, answering directly");
            fallback_analysis()
        }
        Ok(analysis) => analysis,
        Err(err) => {
            tracing::warn!("could not parse multi-hop analysis ({err}); reply was: {reply}");
            fallback_analysis()
        }
    }
}

fn fallback_analysis() -> Analysis {
    Analysis::Direct {
        answer: ANALYSIS_FALLBACK_ANSWER.to_string(),
    }
}

fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening fence.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub async fn multi_hop_reasoning(
    llm: &dyn ChatModel,
    retriever: &dyn PassageRetriever,
    question: &str,
    max_hops: usize,
) -> Result<MultiHopOutcome> {
    let rewritten = rewrite_query(llm, question).await?;
    let initial = retriever.retrieve(&rewritten).await?;
    let initial_context = join_passages(&initial);

    let sub_questions = match analyze_query_complexity(llm, &rewritten, &initial_context).await? {
        Analysis::Direct { answer } => {
            return Ok(MultiHopOutcome {
                answer,
                reasoning_chain: vec![rewritten],
                context_used: initial,
            });
        }
        Analysis::MultiHop { sub_questions } => sub_questions,
    };

    let mut reasoning_chain = vec![rewritten];
    let mut context_used = initial;

    for sub_question in sub_questions.into_iter().take(max_hops) {
        let passages = retriever.retrieve(&sub_question).await?;
        tracing::debug!(
            "sub-question {:?} retrieved {} passages",
            sub_question,
            passages.len()
        );
        context_used.extend(passages);
        reasoning_chain.push(sub_question);
    }

    let explored = reasoning_chain[1..]
        .iter()
        .map(|q| format!("- {q}"))
        .collect::<Vec<_>>()
        .join("\n");

    let messages = [
        PromptMessage::system(SYNTHESIS_SYSTEM_PROMPT),
        PromptMessage::user(format!(
            "Original Question: {question}\n\nSub-questions explored:\n{explored}\n\nCombined Context:\n{}\n\nComprehensive Answer:",
            join_passages(&context_used)
        )),
    ];

    let answer = llm
        .complete(&messages)
        .await
        .context("multi-hop synthesis failed")?;

    Ok(MultiHopOutcome {
        answer,
        reasoning_chain,
        context_used,
    })
}

fn join_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::models::PassageMetadata;
    use crate::testing::ScriptedChatModel;

    /// Returns one passage echoing each query and records what was asked.
    #[derive(Default)]
    struct EchoRetriever {
        queries: Mutex<Vec<String>>,
    }

    impl EchoRetriever {
        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PassageRetriever for EchoRetriever {
        async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(vec![Passage {
                content: format!("passage for {query}"),
                metadata: PassageMetadata::default(),
                score: 0.5,
            }])
        }
    }

    #[tokio::test]
    async fn rewrite_trims_model_output() {
        let llm = ScriptedChatModel::new(["  causes of iron deficiency anemia \n"]);
        let rewritten = rewrite_query(&llm, "why am i tired").await.unwrap();

        assert_eq!(rewritten, "causes of iron deficiency anemia");
        let calls = llm.calls();
        assert!(calls[0][1].content.contains("Original query: why am i tired"));
    }

    #[tokio::test]
    async fn rewrite_failure_propagates() {
        let llm = ScriptedChatModel::new(["!error: model offline"]);
        assert!(rewrite_query(&llm, "fever").await.is_err());
    }

    #[test]
    fn analysis_accepts_fenced_json() {
        let reply = "```json\n{\"type\":\"multi_hop\",\"sub_questions\":[\"a\",\"b\"]}\n```";
        assert_eq!(
            parse_analysis(reply),
            Analysis::MultiHop {
                sub_questions: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(
            parse_analysis(r#"{"type":"direct","answer":"Rest and fluids."}"#),
            Analysis::Direct {
                answer: "Rest and fluids.".to_string()
            }
        );
    }

    #[test]
    fn malformed_analysis_falls_back_to_direct() {
        for reply in [
            "MULTI_HOP: [\"a\"]",
            r#"{"type":"multi_hop"}"#,
            r#"{"type":"multi_hop","sub_questions":[]}"#,
            r#"{"type":"unknown","answer":"x"}"#,
        ] {
            assert_eq!(
                parse_analysis(reply),
                Analysis::Direct {
                    answer: ANALYSIS_FALLBACK_ANSWER.to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn direct_analysis_returns_initial_context() {
        let llm = ScriptedChatModel::new([
            "statin side effects",
            r#"{"type":"direct","answer":"Muscle aches are common."}"#,
        ]);
        let retriever = EchoRetriever::default();

        let outcome = multi_hop_reasoning(&llm, &retriever, "do statins hurt?", 2)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Muscle aches are common.");
        assert_eq!(outcome.reasoning_chain, vec!["statin side effects".to_string()]);
        assert_eq!(outcome.context_used.len(), 1);
        assert_eq!(retriever.queries(), vec!["statin side effects".to_string()]);
    }

    #[tokio::test]
    async fn malformed_analysis_keeps_rewritten_chain() {
        let llm = ScriptedChatModel::new(["rewritten", "not json at all"]);
        let retriever = EchoRetriever::default();

        let outcome = multi_hop_reasoning(&llm, &retriever, "q", 2).await.unwrap();
        assert_eq!(outcome.answer, ANALYSIS_FALLBACK_ANSWER);
        assert_eq!(outcome.reasoning_chain, vec!["rewritten".to_string()]);
    }

    #[tokio::test]
    async fn multi_hop_explores_at_most_max_hops() {
        let llm = ScriptedChatModel::new([
            "warfarin and aspirin interaction",
            r#"{"type":"multi_hop","sub_questions":["what does warfarin do","what does aspirin do","bleeding risk"]}"#,
            "Combined they raise bleeding risk.",
        ]);
        let retriever = EchoRetriever::default();

        let outcome = multi_hop_reasoning(&llm, &retriever, "can I take both?", 2)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Combined they raise bleeding risk.");
        assert_eq!(
            outcome.reasoning_chain,
            vec![
                "warfarin and aspirin interaction".to_string(),
                "what does warfarin do".to_string(),
                "what does aspirin do".to_string(),
            ]
        );
        assert_eq!(outcome.context_used.len(), 3);
        assert_eq!(retriever.queries().len(), 3);

        let calls = llm.calls();
        let synthesis = &calls[2][1].content;
        assert!(synthesis.starts_with("Original Question: can I take both?"));
        assert!(synthesis.contains("- what does warfarin do\n- what does aspirin do"));
        assert!(synthesis.contains(
            "passage for warfarin and aspirin interaction\n\npassage for what does warfarin do"
        ));
        assert!(!synthesis.contains("- bleeding risk"));
    }
}
