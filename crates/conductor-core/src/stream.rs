use futures::StreamExt;

use crate::errors::ProviderError;
use crate::provider::ChunkStream;

/// Drain a chunk stream, forwarding every fragment to `sink` as it arrives.
/// Returns the concatenated text, or the first error the stream yields.
pub async fn collect_chunks(
    mut stream: ChunkStream,
    mut sink: impl FnMut(&str),
) -> Result<String, ProviderError> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        sink(&chunk);
        text.push_str(&chunk);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(items: Vec<Result<String, ProviderError>>) -> ChunkStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn concatenates_and_forwards() {
        let mut seen = Vec::new();
        let text = collect_chunks(
            chunks(vec![Ok("Hel".into()), Ok(String::new()), Ok("lo".into())]),
            |c| seen.push(c.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(text, "Hello");
        assert_eq!(seen, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn stops_at_first_error() {
        let mut seen = 0;
        let result = collect_chunks(
            chunks(vec![
                Ok("partial".into()),
                Err(ProviderError::StreamInterrupted("eof".into())),
                Ok("never".into()),
            ]),
            |_| seen += 1,
        )
        .await;
        assert!(matches!(result, Err(ProviderError::StreamInterrupted(_))));
        assert_eq!(seen, 1);
    }
}
