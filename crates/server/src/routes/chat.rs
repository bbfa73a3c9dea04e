//! `/v1/chat/completions` proxy: checks the inference subprocess is
//! healthy, then forwards non-streaming requests as plain JSON and
//! streaming ones as a transparent SSE passthrough.

use axum::Json;
use axum::response::{IntoResponse, Sse};
use axum::response::sse::{Event, KeepAlive};
use futures::StreamExt;

use orc_core::{AgentError, ChatRequest, ChatResponse};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn chat_completions(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<axum::response::Response, ApiError> {
    if !state.inference.health().await {
        return Err(AgentError::UpstreamUnavailable(
            "inference subprocess is not healthy".to_string(),
        )
        .into());
    }

    if request.stream {
        Ok(stream_chat_completions(state, request).await.into_response())
    } else {
        let response: ChatResponse = state
            .inference
            .chat_completion(&request)
            .await
            .map_err(ApiError::from)?;
        Ok(Json(response).into_response())
    }
}

async fn stream_chat_completions(
    state: AppState,
    request: ChatRequest,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    use orc_inference::StreamEvent;

    let upstream = state.inference.chat_completion_stream(&request).await;

    let events = futures::stream::once(async move { upstream }).flat_map(|result| match result {
        Ok(stream) => stream
            .map(|event| -> Result<Event, std::convert::Infallible> {
                match event {
                    Ok(StreamEvent::Chunk(chunk)) => {
                        let json = serde_json::to_string(&chunk).unwrap_or_default();
                        Ok(Event::default().data(json))
                    }
                    Ok(StreamEvent::Done) => Ok(Event::default().data("[DONE]")),
                    Err(err) => Ok(Event::default().event("error").data(err.to_string())),
                }
            })
            .boxed(),
        Err(err) => futures::stream::once(async move {
            Ok::<_, std::convert::Infallible>(Event::default().event("error").data(err.to_string()))
        })
        .boxed(),
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
