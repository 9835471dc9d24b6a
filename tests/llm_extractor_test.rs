use nlq_engine::config::{EngineConfig, ExtractorKind, LlmConfig};
use nlq_engine::extract::{EntityExtractor, LlmExtractor};
use nlq_engine::knowledge::DomainKnowledgeBase;
use nlq_engine::orchestrator::QueryOrchestrator;
use nlq_engine::NlqError;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Serves a single HTTP response and hands back the raw request it received.
async fn mock_completion(status: u16, body: String) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }

        let reason = if status == 200 { "OK" } else { "Internal Server Error" };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
    });

    (format!("http://{}/v1", addr), rx)
}

fn completion(content: &str) -> String {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
    .to_string()
}

fn llm_config(base_url: String) -> LlmConfig {
    LlmConfig {
        api_key: Some("test-key".to_string()),
        model: "test-model".to_string(),
        base_url,
    }
}

const ANSWER: &str = r#"{"metrics": [{"name": "deposits", "aggregation": null}],
 "dimensions": [],
 "filters": [{"dimension": "country", "operator": "equals", "value": "UK", "negated": false}],
 "time_range": {"relative_period": "last_week", "start": null, "end": null},
 "comparisons": [], "sort": null, "limit": null}"#;

#[tokio::test]
async fn test_llm_extraction_against_mock_server() {
    let (base_url, request) = mock_completion(200, completion(ANSWER)).await;
    let kb = DomainKnowledgeBase::gaming();
    let extractor = LlmExtractor::new(&llm_config(base_url), &kb).unwrap();

    let entities = extractor.extract("show me deposits for UK last week").await.unwrap();
    assert_eq!(entities.metrics[0].name, "deposits");
    assert_eq!(entities.filters[0].value, "UK");
    assert_eq!(
        entities.time_range.unwrap().relative_period.as_deref(),
        Some("last_week")
    );

    let request = request.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions"));
    assert!(request.to_lowercase().contains("authorization: bearer test-key"));
    assert!(request.contains("\"model\":\"test-model\""));
    assert!(request.contains("show me deposits for UK last week"));
}

#[tokio::test]
async fn test_server_error_is_extraction_error() {
    let (base_url, _request) = mock_completion(500, "{\"error\":\"boom\"}".to_string()).await;
    let extractor =
        LlmExtractor::new(&llm_config(base_url), &DomainKnowledgeBase::gaming()).unwrap();
    let result = extractor.extract("revenue by country").await;
    assert!(matches!(result, Err(NlqError::Extraction(_))));
}

#[tokio::test]
async fn test_orchestrator_uses_llm_answer() {
    let (base_url, _request) = mock_completion(200, completion(ANSWER)).await;
    let config = EngineConfig {
        extractor: ExtractorKind::Llm,
        llm: llm_config(base_url),
        ..EngineConfig::default()
    };
    let orchestrator =
        QueryOrchestrator::new(&config, Arc::new(DomainKnowledgeBase::gaming())).unwrap();
    assert_eq!(orchestrator.extractor_name(), "llm");

    let result = orchestrator.process("deposits in the UK, last week please").await;
    assert!(result.is_successful);
    let sql = result.sql.unwrap();
    assert!(sql.contains("SUM(Payments.DepositAmount) AS deposits"));
    assert!(sql.contains("Players.Country = 'UK'"));
}

#[tokio::test]
async fn test_orchestrator_falls_back_when_llm_fails() {
    let (base_url, _request) = mock_completion(500, "{}".to_string()).await;
    let config = EngineConfig {
        extractor: ExtractorKind::Llm,
        llm: llm_config(base_url),
        ..EngineConfig::default()
    };
    let orchestrator =
        QueryOrchestrator::new(&config, Arc::new(DomainKnowledgeBase::gaming())).unwrap();

    let result = orchestrator.process("top 3 ggr by provider").await;
    assert!(result.is_successful);
    assert_eq!(result.entities.limit, Some(3));
    assert!(result.sql.unwrap().ends_with("ORDER BY ggr DESC LIMIT 3"));
}
