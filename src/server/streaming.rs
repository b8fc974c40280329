use super::ChatCompletionChunk;
use axum::response::sse::Event;
use flume::r#async::RecvStream;
use futures::{Stream, StreamExt};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::watch;

#[derive(PartialEq)]
pub enum StreamingStatus {
    Uninitialized,
    Started,
    Interrupted,
    Stopped,
}

pub enum ChatResponse {
    InternalError(String),
    ValidationError(String),
    Chunk(ChatCompletionChunk),
    Done, //finish flag
}

/// SSE body for the chat-completions endpoint. Emits one `data:` line per
/// chunk and the literal `[DONE]` sentinel at the end of a complete stream.
/// Dropping a streamer that was not stopped signals the pump task that the
/// client went away.
pub struct Streamer {
    rx: RecvStream<'static, ChatResponse>,
    status: StreamingStatus,
    disconnect_tx: Option<watch::Sender<bool>>,
}

impl Streamer {
    pub fn new(rx: flume::Receiver<ChatResponse>, disconnect_tx: Option<watch::Sender<bool>>) -> Self {
        Self {
            rx: rx.into_stream(),
            status: StreamingStatus::Uninitialized,
            disconnect_tx,
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.status != StreamingStatus::Stopped {
            if let Some(tx) = self.disconnect_tx.as_ref() {
                let _ = tx.send(true);
            }
        }
    }
}

impl Stream for Streamer {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.status == StreamingStatus::Stopped {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(resp)) => match resp {
                ChatResponse::InternalError(e) | ChatResponse::ValidationError(e) => {
                    Poll::Ready(Some(Ok(Event::default().data(e))))
                }
                ChatResponse::Chunk(chunk) => {
                    if self.status != StreamingStatus::Started {
                        self.status = StreamingStatus::Started;
                    }
                    Poll::Ready(Some(Event::default().json_data(&chunk)))
                }
                ChatResponse::Done => {
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(Some(Ok(Event::default().data("[DONE]"))))
                }
            },
            Poll::Ready(None) => {
                self.status = StreamingStatus::Interrupted;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
