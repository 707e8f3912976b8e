//! Incremental decoder for the named-event text stream.
//!
//! Frames are `field: value` lines terminated by a blank line. `event`
//! names the frame (default `message`), repeated `data` lines are joined
//! with `\n`, lines starting with `:` are comments. Input may arrive split
//! at arbitrary byte boundaries.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
   pub event: String,
   pub data:  String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
   buf:   Vec<u8>,
   event: Option<String>,
   data:  Vec<String>,
}

impl SseDecoder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Feeds a chunk and returns every frame it completes.
   pub fn push(&mut self, chunk: &[u8]) -> Vec<PushFrame> {
      self.buf.extend_from_slice(chunk);
      let mut frames = Vec::new();

      while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
         let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
         line.pop();
         if line.last() == Some(&b'\r') {
            line.pop();
         }
         let line = String::from_utf8_lossy(&line);
         if let Some(frame) = self.handle_line(&line) {
            frames.push(frame);
         }
      }
      frames
   }

   fn handle_line(&mut self, line: &str) -> Option<PushFrame> {
      if line.is_empty() {
         return self.dispatch();
      }
      if line.starts_with(':') {
         return None;
      }
      let (field, value) = match line.split_once(':') {
         Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
         None => (line, ""),
      };
      match field {
         "event" => self.event = Some(value.to_string()),
         "data" => self.data.push(value.to_string()),
         _ => {},
      }
      None
   }

   fn dispatch(&mut self) -> Option<PushFrame> {
      let event = self.event.take();
      if self.data.is_empty() {
         return None;
      }
      let data = std::mem::take(&mut self.data).join("\n");
      Some(PushFrame { event: event.unwrap_or_else(|| "message".to_string()), data })
   }
}
