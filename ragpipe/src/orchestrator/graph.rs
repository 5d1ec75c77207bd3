//! The query path expressed as a DAG.

use super::Inner;
use crate::errors::{PipelineError, StageContractError};
use crate::graph::{node_fn, Graph, NodeInput, NodeOptions};
use crate::plugins::{Document, Embedding};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

/// Embeds the prompt.
pub const EMBED_QUERY_NODE: &str = "embed_query";
/// Retrieves context for the query vector.
pub const RETRIEVE_NODE: &str = "retrieve";
/// Reorders the retrieved context; optional.
pub const RERANK_NODE: &str = "rerank";
/// Generates the answer.
pub const GENERATE_NODE: &str = "generate";

pub(super) fn decode<T: DeserializeOwned>(stage: &str, value: Option<&Value>) -> Result<T, PipelineError> {
    let value = value.ok_or_else(|| StageContractError::new(stage, "an upstream result", "nothing"))?;
    serde_json::from_value(value.clone()).map_err(|e| {
        StageContractError::new(stage, std::any::type_name::<T>(), e.to_string()).into()
    })
}

fn encode<T: Serialize>(stage: &str, value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value)
        .map_err(|e| StageContractError::new(stage, "a JSON value", e.to_string()).into())
}

fn prompt_of(input: &NodeInput) -> Result<String, PipelineError> {
    input
        .seed
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PipelineError::validation("seed must carry a string 'prompt'"))
}

/// Nodes hold the orchestrator weakly; the orchestrator caches the graph.
fn upgrade(inner: &Weak<Inner>) -> Result<Arc<Inner>, PipelineError> {
    inner
        .upgrade()
        .ok_or_else(|| PipelineError::Unavailable("orchestrator was dropped".to_string()))
}

pub(super) fn build_query_graph(owner: &Arc<Inner>) -> Result<Graph, PipelineError> {
    let mut graph = Graph::new("query");
    let weak = Arc::downgrade(owner);

    let embed = {
        let inner = weak.clone();
        node_fn(EMBED_QUERY_NODE, move |input: NodeInput| {
            let inner = inner.clone();
            async move {
                let inner = upgrade(&inner)?;
                let prompt = prompt_of(&input)?;
                let vector = inner
                    .stage(EMBED_QUERY_NODE, || inner.embedder.embed_query(&prompt))
                    .await?;
                encode(EMBED_QUERY_NODE, &vector)
            }
        })
    };
    graph.add_node(EMBED_QUERY_NODE, embed, NodeOptions::new())?;

    let retrieve = {
        let inner = weak.clone();
        node_fn(RETRIEVE_NODE, move |input: NodeInput| {
            let inner = inner.clone();
            async move {
                let inner = upgrade(&inner)?;
                let vector: Embedding = decode(RETRIEVE_NODE, input.get(EMBED_QUERY_NODE))?;
                let documents = inner
                    .stage(RETRIEVE_NODE, || inner.retriever.retrieve(&vector))
                    .await?;
                encode(RETRIEVE_NODE, &documents)
            }
        })
    };
    graph.add_node(
        RETRIEVE_NODE,
        retrieve,
        NodeOptions::new().depends_on(EMBED_QUERY_NODE),
    )?;

    let mut generate_options = NodeOptions::new().depends_on(RETRIEVE_NODE);
    if owner.reranker_enabled().is_some() {
        let rerank = {
            let inner = weak.clone();
            node_fn(RERANK_NODE, move |input: NodeInput| {
                let inner = inner.clone();
                async move {
                    let inner = upgrade(&inner)?;
                    let prompt = prompt_of(&input)?;
                    let documents: Vec<Document> = decode(RERANK_NODE, input.get(RETRIEVE_NODE))?;
                    let reranked = inner.rerank(&prompt, documents).await?;
                    encode(RERANK_NODE, &reranked)
                }
            })
        };
        graph.add_node(
            RERANK_NODE,
            rerank,
            NodeOptions::new().depends_on(RETRIEVE_NODE).optional(),
        )?;
        generate_options = generate_options.depends_on(RERANK_NODE);
    }

    let generate = {
        let inner = weak.clone();
        node_fn(GENERATE_NODE, move |input: NodeInput| {
            let inner = inner.clone();
            async move {
                let inner = upgrade(&inner)?;
                let prompt = prompt_of(&input)?;
                // A failed rerank arrives as null; fall back to retrieval order.
                let documents: Vec<Document> = match input.get(RERANK_NODE) {
                    Some(reranked) if !reranked.is_null() => decode(GENERATE_NODE, Some(reranked))?,
                    _ => decode(GENERATE_NODE, input.get(RETRIEVE_NODE))?,
                };
                let answer = inner.generate(&prompt, &documents).await?;
                Ok(json!({ "answer": answer, "documents": documents }))
            }
        })
    };
    graph.add_node(GENERATE_NODE, generate, generate_options)?;
    graph.require(GENERATE_NODE);

    graph.validate_topology()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reports_stage_and_shape() {
        let err = decode::<Vec<f32>>("retrieve", Some(&json!("not a vector"))).unwrap_err();
        assert!(matches!(err, PipelineError::StageContract(ref e) if e.stage == "retrieve"));

        let err = decode::<Vec<f32>>("retrieve", None).unwrap_err();
        assert!(err.to_string().contains("an upstream result"));
    }
}
