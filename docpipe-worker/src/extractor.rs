//! Text extraction through an OCR service.
//!
//! The service receives `{"fileUrl", "language"}` and answers with newline delimited JSON
//! messages. Progress messages carry a `progress` fraction between 0 and 1, the final message
//! carries the recognized `text` or an `error`. A service answering with a single JSON object
//! holding `text` is also accepted.
use async_trait::async_trait;
use docpipe::executor::{CapabilityError, Extractor, ProgressSink, Tick};
use serde::{Deserialize, Serialize};

const DEFAULT_LANGUAGE: &str = "eng";

#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
    language: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OcrRequest<'a> {
    file_url: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct OcrMessage {
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpExtractor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            language: DEFAULT_LANGUAGE.to_owned(),
        }
    }

    pub fn with_language(self, language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..self
        }
    }
}

fn failed(error: impl ToString) -> CapabilityError {
    CapabilityError::Failed(error.to_string())
}

/// Handles one message, returning the text once it arrives.
async fn handle_line(
    line: &[u8],
    progress: &dyn ProgressSink,
) -> Result<Option<String>, CapabilityError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let message: OcrMessage = serde_json::from_slice(line)
        .map_err(|error| failed(format!("Malformed OCR response: {error}")))?;
    if let Some(error) = message.error {
        return Err(failed(error));
    }
    if let Some(text) = message.text {
        return Ok(Some(text.trim().to_owned()));
    }
    if let Some(fraction) = message.progress {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        if progress.progress(percent).await == Tick::Cancel {
            return Err(CapabilityError::Cancelled);
        }
    }
    Ok(None)
}

#[async_trait]
impl Extractor for HttpExtractor {
    #[tracing::instrument(skip(self, progress))]
    async fn extract(
        &self,
        file_url: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, CapabilityError> {
        let mut response = self
            .client
            .post(&self.url)
            .json(&OcrRequest {
                file_url,
                language: &self.language,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(failed)?;

        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(failed)? {
            buffer.extend_from_slice(&chunk);
            while let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                if let Some(text) = handle_line(&line, progress).await? {
                    return Ok(text);
                }
            }
        }
        match handle_line(&buffer, progress).await? {
            Some(text) => Ok(text),
            None => Err(failed("OCR service finished without text")),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        ticks: Mutex<Vec<u8>>,
        cancel_at: Option<u8>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn progress(&self, percent: u8) -> Tick {
            self.ticks.lock().unwrap().push(percent);
            if self.cancel_at.is_some_and(|at| percent >= at) {
                Tick::Cancel
            } else {
                Tick::Continue
            }
        }
    }

    async fn serve(body: &'static str, status: StatusCode) -> String {
        let app = Router::new().route(
            "/ocr",
            post(move |Json(request): Json<Value>| async move {
                assert_eq!(request["fileUrl"], "https://x/doc.png");
                assert_eq!(request["language"], "eng");
                (status, body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/ocr")
    }

    #[tokio::test]
    async fn progress_is_forwarded_until_text_arrives() {
        let url = serve(
            "{\"status\":\"recognizing text\",\"progress\":0.25}\n\
             {\"status\":\"recognizing text\",\"progress\":0.5}\n\
             {\"text\":\"  Hello world \\n\"}\n",
            StatusCode::OK,
        )
        .await;
        let sink = RecordingSink::default();

        let text = HttpExtractor::new(url)
            .extract("https://x/doc.png", &sink)
            .await
            .unwrap();

        assert_eq!(text, "Hello world");
        assert_eq!(*sink.ticks.lock().unwrap(), vec![25, 50]);
    }

    #[tokio::test]
    async fn single_object_response_is_accepted() {
        let url = serve("{\"text\":\"ABC\"}", StatusCode::OK).await;

        let text = HttpExtractor::new(url)
            .extract("https://x/doc.png", &RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(text, "ABC");
    }

    #[tokio::test]
    async fn cancellation_stops_the_extraction() {
        let url = serve(
            "{\"progress\":0.1}\n{\"progress\":0.6}\n{\"text\":\"never\"}\n",
            StatusCode::OK,
        )
        .await;
        let sink = RecordingSink {
            cancel_at: Some(50),
            ..Default::default()
        };

        let result = HttpExtractor::new(url)
            .extract("https://x/doc.png", &sink)
            .await;

        assert_matches!(result, Err(CapabilityError::Cancelled));
        assert_eq!(*sink.ticks.lock().unwrap(), vec![10, 60]);
    }

    #[tokio::test]
    async fn service_failures_fail_the_stage() {
        let reported = serve("{\"error\":\"unreadable image\"}\n", StatusCode::OK).await;
        assert_matches!(
            HttpExtractor::new(reported)
                .extract("https://x/doc.png", &RecordingSink::default())
                .await,
            Err(CapabilityError::Failed(error)) if error == "unreadable image"
        );

        let crashed = serve("boom", StatusCode::BAD_GATEWAY).await;
        assert_matches!(
            HttpExtractor::new(crashed)
                .extract("https://x/doc.png", &RecordingSink::default())
                .await,
            Err(CapabilityError::Failed(_))
        );

        let silent = serve("{\"progress\":1.0}\n", StatusCode::OK).await;
        assert_matches!(
            HttpExtractor::new(silent)
                .extract("https://x/doc.png", &RecordingSink::default())
                .await,
            Err(CapabilityError::Failed(error)) if error.contains("without text")
        );
    }
}
