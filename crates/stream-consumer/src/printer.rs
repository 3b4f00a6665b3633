//! 把消费到的消息输出为一行 JSON

use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use stream_kafka::Message;

#[derive(Debug, Serialize)]
struct Line<'a> {
    topic: &'a str,
    key: String,
    partition: i32,
    offset: i64,
    payload: Value,
}

/// 渲染单条消息
///
/// 负载是合法 JSON 时原样嵌入，否则作为字符串输出。
pub fn render(message: &Message) -> serde_json::Result<String> {
    let payload = serde_json::from_slice::<Value>(&message.payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.payload).into_owned()));

    serde_json::to_string(&Line {
        topic: &message.topic,
        key: String::from_utf8_lossy(&message.key).into_owned(),
        partition: message.partition_or_unknown(),
        offset: message.offset,
        payload,
    })
}

/// 按行写出消息，多个分区任务共享同一个输出
pub struct JsonLinePrinter<W> {
    out: Mutex<W>,
}

impl<W: Write> JsonLinePrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn print(&self, message: &Message) -> anyhow::Result<()> {
        let line = render(message)?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}
