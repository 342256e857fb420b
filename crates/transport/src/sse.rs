use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt, future};

/// Turns a chunked response body into the `data` payload of each server-sent event.
///
/// Events without data (keep-alive comments, bare `event:` lines) are skipped.
pub(crate) fn event_frames<S, B, E>(
    body: S,
) -> impl Stream<Item = Result<String, EventStreamError<E>>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    body.eventsource().filter_map(|event| {
        future::ready(match event {
            Ok(event) if event.data.is_empty() => None,
            Ok(event) => Some(Ok(event.data)),
            Err(error) => Some(Err(error)),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    async fn frames(chunks: &[&'static str]) -> Vec<String> {
        let body = futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok::<_, Infallible>(chunk.as_bytes())),
        );
        event_frames(body)
            .map(|frame| frame.expect("well-formed event stream"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let frames = frames(&[
            "data: {\"respo",
            "nse\":\"Hi\"}\n",
            "\ndata: [DONE]\n\n",
        ])
        .await;
        assert_eq!(frames, vec!["{\"response\":\"Hi\"}", "[DONE]"]);
    }

    #[tokio::test]
    async fn comments_and_foreign_fields_are_ignored() {
        let frames = frames(&[
            ": keep-alive\n\n",
            "event: message\nid: 7\ndata: a\r\n\r\n",
        ])
        .await;
        assert_eq!(frames, vec!["a"]);
    }

    #[tokio::test]
    async fn multi_line_data_is_joined_with_newlines() {
        let frames = frames(&["data: first\ndata:second\n\n"]).await;
        assert_eq!(frames, vec!["first\nsecond"]);
    }
}
