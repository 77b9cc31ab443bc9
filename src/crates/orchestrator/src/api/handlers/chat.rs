//! Streaming chat handler: engine events as server-sent events

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::Stream;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::gateway::{ChatChunk, ChatRequest, StreamItem};

/// `POST /chat/stream` - SSE stream in the wire chunk grammar
///
/// Closing the connection drops the stream, which cancels the underlying
/// workflow; the `[DONE]` sentinel terminates every successful stream.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut chat = state.runtime.gateway.chat_stream(request).await?;
    tracing::info!(session_id = %chat.session_id, "chat stream opened");

    let stream = async_stream::stream! {
        while let Some(item) = chat.next_item().await {
            match item {
                StreamItem::Keepalive => {
                    yield Ok(Event::default().comment("keepalive"));
                }
                StreamItem::Chunk(chunk) => {
                    let is_done = matches!(chunk, ChatChunk::Done { .. });
                    match serde_json::to_string(&chunk) {
                        Ok(data) => yield Ok(Event::default().data(data)),
                        Err(err) => {
                            tracing::error!("chunk serialization failed: {err}");
                        }
                    }
                    if is_done {
                        yield Ok(Event::default().data("[DONE]"));
                        break;
                    }
                }
            }
        }
    };
    Ok(Sse::new(stream))
}
