#![allow(dead_code)]
// Shared harness for standing in as the streaming service.
use serde_json::json;
use tokio::task::JoinHandle;
use weir_core::Connection;
use weir_wire::Message;

pub fn api_error(code: i64, err_code: u16, description: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "error": {"code": code, "err_code": err_code, "description": description}
    }))
    .expect("encode error envelope")
}

pub fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("encode payload")
}

/// Mount a scripted responder: for every message matching `filter`, the
/// closure may produce a reply payload for the request's reply subject.
pub fn serve(
    conn: &Connection,
    filter: &str,
    mut respond: impl FnMut(&Message) -> Option<Vec<u8>> + Send + 'static,
) -> JoinHandle<()> {
    let mut sub = conn.subscribe(filter).expect("subscribe responder");
    let conn = conn.clone();
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let body = respond(&msg);
            if let (Some(reply), Some(body)) = (msg.reply.as_deref(), body) {
                conn.publish(reply, body).expect("publish reply");
            }
        }
    })
}
