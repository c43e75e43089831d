//! Turn back-end replies into plain text.

use std::pin::Pin;
use std::time::Duration;
use futures::{Stream, StreamExt};
use serde_json::Value;
use log::error;

use crate::error::Error;

/// Raw reply chunks from a back end, in arrival order
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Value, Error>> + Send>>;

/// Normalized text chunks. Single pass: reading it again means calling the
/// back end again. Dropping it stops pulling from the back end.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

/// Text of one reply.
///
/// An object's `content` is returned as is when it is a string and as JSON
/// text otherwise. A bare string is returned unchanged; anything else is
/// serialized whole.
pub fn normalize(reply: &Value) -> String
{   match reply
    {   Value::Object(map) => match map.get("content")
        {   Some(Value::String(s)) => s.clone()
          , Some(content) => content.to_string()
          , None => reply.to_string()
        }
      , Value::String(s) => s.clone()
      , other => other.to_string()
    }
}

/// Normalize each chunk independently; no buffering or reordering
pub fn normalize_stream(replies: ReplyStream) -> TextStream
{   Box::pin(replies.map(|chunk| chunk.map(|v| normalize(&v))))
}

/// End the stream with `Error::Timeout` if no chunk arrives within `idle`
pub fn with_idle_timeout(mut inner: TextStream, idle: Duration) -> TextStream
{   Box::pin(async_stream::stream! {
      loop
      { match tokio::time::timeout(idle, inner.next()).await
        {   Ok(Some(chunk)) => {
              yield chunk;
            }
          , Ok(None) => break
          , Err(_) => {
              error!("No stream chunk within {:?}", idle);
              yield Err(Error::Timeout);
              break;
            }
        }
      }
    })
}

/// Drain a text stream into one string
pub async fn collect_text(mut stream: TextStream) -> Result<String, Error>
{   let mut text = String::new();
    while let Some(chunk) = stream.next().await
    {   text.push_str(&chunk?);
    }
    Ok(text)
}
