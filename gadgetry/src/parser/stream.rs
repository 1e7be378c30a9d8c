//! The marker state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{MarkerConfig, ParsedGadgetCall, ParserEvent, SchemaSource, deps};
use crate::id;
use crate::params::parse_params;

/// Parser state. `EndSuffix` exists so the optional `:id` suffix on the end
/// marker can be recognized across a chunk boundary without changing the
/// emitted events.
#[derive(Debug)]
enum State {
    Outside,
    Header,
    Body { header: HeaderInfo },
    EndSuffix { header: HeaderInfo, body: String },
}

#[derive(Debug, Clone)]
struct HeaderInfo {
    name: String,
    id: Option<String>,
    error: Option<String>,
}

/// Incremental parser that splits an LLM text stream into free text and
/// gadget invocations.
///
/// Single-writer: exactly one consumer of the LLM stream feeds it. Buffered
/// state survives arbitrary chunk boundaries; [`StreamParser::finalize`]
/// flushes leniently when the stream ends mid-invocation (models sometimes
/// forget closers).
pub struct StreamParser {
    markers: MarkerConfig,
    schemas: Option<Arc<dyn SchemaSource>>,
    buffer: String,
    state: State,
}

impl fmt::Debug for StreamParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamParser")
            .field("markers", &self.markers)
            .field("buffered", &self.buffer.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl StreamParser {
    /// Create a parser with the given markers.
    #[must_use]
    pub fn new(markers: MarkerConfig) -> Self {
        Self {
            markers,
            schemas: None,
            buffer: String::new(),
            state: State::Outside,
        }
    }

    /// Attach a schema source so block-format bodies coerce schema-aware.
    #[must_use]
    pub fn with_schemas(mut self, schemas: Arc<dyn SchemaSource>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// The marker configuration.
    #[must_use]
    pub fn markers(&self) -> &MarkerConfig {
        &self.markers
    }

    /// Consume one more fragment of the stream, returning every event the
    /// fragment completes, in input order.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        self.advance(&mut events);
        events
    }

    /// Flush pending state after the stream ends.
    ///
    /// An open invocation is emitted best-effort: collected body text counts
    /// as raw params even without the end marker. Buffered free text becomes
    /// a final text event.
    pub fn finalize(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        self.advance(&mut events);

        match std::mem::replace(&mut self.state, State::Outside) {
            State::Outside => {
                if !self.buffer.is_empty() {
                    events.push(ParserEvent::Text(std::mem::take(&mut self.buffer)));
                }
            }
            State::Header => {
                let header_text = std::mem::take(&mut self.buffer);
                let header = parse_header(header_text.trim_end_matches('\r'));
                events.push(self.emit_call(header, String::new()));
            }
            State::Body { header } => {
                let body = std::mem::take(&mut self.buffer);
                events.push(self.emit_call(header, body));
            }
            State::EndSuffix { header, body } => {
                if let Some(len) = suffix_len_lenient(&self.buffer) {
                    self.buffer.drain(..len);
                }
                events.push(self.emit_call(header, body));
                if !self.buffer.is_empty() {
                    events.push(ParserEvent::Text(std::mem::take(&mut self.buffer)));
                }
            }
        }
        events
    }

    /// Discard all buffered state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Outside;
    }

    /// Run the state machine until it needs more input.
    fn advance(&mut self, events: &mut Vec<ParserEvent>) {
        loop {
            match std::mem::replace(&mut self.state, State::Outside) {
                State::Outside => {
                    if let Some(at) = self.buffer.find(&self.markers.start_prefix) {
                        if at > 0 {
                            let text: String = self.buffer.drain(..at).collect();
                            events.push(ParserEvent::Text(text));
                        }
                        self.buffer.drain(..self.markers.start_prefix.len());
                        self.state = State::Header;
                    } else {
                        // Retain a tail that could still become the start
                        // marker; everything before it is settled text.
                        let keep = partial_prefix_len(&self.buffer, &self.markers.start_prefix);
                        let flush = self.buffer.len() - keep;
                        if flush > 0 {
                            let text: String = self.buffer.drain(..flush).collect();
                            events.push(ParserEvent::Text(text));
                        }
                        return;
                    }
                }
                State::Header => {
                    if let Some(nl) = self.buffer.find('\n') {
                        let header = parse_header(self.buffer[..nl].trim_end_matches('\r'));
                        self.buffer.drain(..=nl);
                        self.state = State::Body { header };
                    } else {
                        self.state = State::Header;
                        return;
                    }
                }
                State::Body { header } => {
                    if let Some(at) = self.buffer.find(&self.markers.end_prefix) {
                        let body: String = self.buffer.drain(..at).collect();
                        self.buffer.drain(..self.markers.end_prefix.len());
                        self.state = State::EndSuffix { header, body };
                    } else {
                        self.state = State::Body { header };
                        return;
                    }
                }
                State::EndSuffix { header, body } => match suffix_decision(&self.buffer) {
                    SuffixDecision::NeedMore => {
                        self.state = State::EndSuffix { header, body };
                        return;
                    }
                    SuffixDecision::Consume(len) => {
                        self.buffer.drain(..len);
                        events.push(self.emit_call(header, body));
                    }
                    SuffixDecision::Absent => {
                        events.push(self.emit_call(header, body));
                    }
                },
            }
        }
    }

    fn emit_call(&self, header: HeaderInfo, body: String) -> ParserEvent {
        let invocation_id = header.id.unwrap_or_else(id::next_invocation_id);
        let mut call = ParsedGadgetCall {
            name: header.name,
            invocation_id,
            params_raw: body,
            params: None,
            parse_error: header.error,
            dependencies: BTreeSet::new(),
        };

        if call.parse_error.is_none() {
            let introspector = self
                .schemas
                .as_ref()
                .and_then(|source| source.introspector_for(&call.name));
            match parse_params(&call.params_raw, &self.markers.arg_prefix, introspector.as_ref()) {
                Ok(params) => {
                    call.dependencies = deps::harvest(&params);
                    call.params = Some(params);
                }
                Err(message) => {
                    debug!(gadget = %call.name, id = %call.invocation_id, error = %message,
                           "gadget body failed to parse");
                    call.parse_error = Some(message);
                }
            }
        }

        ParserEvent::GadgetCall(call)
    }
}

enum SuffixDecision {
    /// The buffer may still grow into a `:id` suffix.
    NeedMore,
    /// A suffix of this byte length is present.
    Consume(usize),
    /// No suffix adjoins the end marker.
    Absent,
}

fn suffix_decision(buffer: &str) -> SuffixDecision {
    let Some(rest) = buffer.strip_prefix(':') else {
        return if buffer.is_empty() {
            SuffixDecision::NeedMore
        } else {
            SuffixDecision::Absent
        };
    };
    let run = rest.bytes().take_while(|b| is_id_byte(*b)).count();
    if run == rest.len() {
        // Could be ":" alone or ":partial-id" with more bytes coming.
        return SuffixDecision::NeedMore;
    }
    if run == 0 {
        // A colon followed by something else is ordinary text.
        return SuffixDecision::Absent;
    }
    SuffixDecision::Consume(1 + run)
}

/// Lenient suffix recognition at end of stream: `:` plus at least one id
/// byte counts, nothing else does.
fn suffix_len_lenient(buffer: &str) -> Option<usize> {
    let rest = buffer.strip_prefix(':')?;
    let run = rest.bytes().take_while(|b| is_id_byte(*b)).count();
    (run > 0).then_some(1 + run)
}

fn is_id_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

/// The longest strict prefix of `prefix` that the buffer ends with.
fn partial_prefix_len(buffer: &str, prefix: &str) -> usize {
    let max = buffer.len().min(prefix.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&len| buffer.ends_with(&prefix[..len]))
        .unwrap_or(0)
}

/// Header grammar: `name` or `name:invocation_id`.
fn parse_header(text: &str) -> HeaderInfo {
    let trimmed = text.trim();
    let (name, id) = match trimmed.split_once(':') {
        Some((name, id)) => (name.trim(), {
            let id = id.trim();
            (!id.is_empty()).then(|| id.to_string())
        }),
        None => (trimmed, None),
    };

    let error = if name.is_empty() {
        Some("missing gadget name in start marker".to_string())
    } else if name.chars().any(char::is_whitespace) {
        Some(format!("malformed gadget name '{name}' in start marker"))
    } else {
        None
    };

    HeaderInfo {
        name: name.to_string(),
        id,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> StreamParser {
        StreamParser::new(MarkerConfig::default())
    }

    fn parse_all(input: &str) -> Vec<ParserEvent> {
        let mut p = parser();
        let mut events = p.feed(input);
        events.extend(p.finalize());
        events
    }

    /// Merge adjacent text events so chunking granularity does not affect
    /// sequence comparison.
    fn coalesce(events: Vec<ParserEvent>) -> Vec<ParserEvent> {
        let mut out: Vec<ParserEvent> = Vec::new();
        for event in events {
            match (out.last_mut(), &event) {
                (Some(ParserEvent::Text(acc)), ParserEvent::Text(text)) => acc.push_str(text),
                _ => out.push(event),
            }
        }
        out
    }

    #[test]
    fn back_to_back_gadgets_without_separators() {
        let input = "Let's go.!!!GADGET_START:SetTodoStatus\n{\"index\":1,\"status\":\"done\"}\n!!!GADGET_END!!!GADGET_START:SetTodoStatus\n{\"index\":2,\"status\":\"in_progress\"}\n!!!GADGET_END";
        let events = parse_all(input);
        assert_eq!(events.len(), 3);

        assert_eq!(events[0], ParserEvent::Text("Let's go.".into()));

        let first = events[1].as_call().unwrap();
        assert_eq!(first.name, "SetTodoStatus");
        assert_eq!(first.params, Some(json!({ "index": 1, "status": "done" })));
        assert!(first.parse_error.is_none());

        let second = events[2].as_call().unwrap();
        assert_eq!(second.params, Some(json!({ "index": 2, "status": "in_progress" })));

        // Minted ids are distinct and ordered.
        let a: u64 = first.invocation_id["gadget_".len()..].parse().unwrap();
        let b: u64 = second.invocation_id["gadget_".len()..].parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn byte_at_a_time_equals_whole_feed() {
        let input = "Intro text\n!!!GADGET_START:Alpha:a1\n{\"x\":1}\n!!!GADGET_END:a1 trailing!!!GADGET_START:Beta\n!!!ARG:k\nv\n!!!GADGET_END";
        let whole = coalesce(parse_all(input));

        let mut p = parser();
        let mut events = Vec::new();
        let mut buf = [0u8; 4];
        for ch in input.chars() {
            events.extend(p.feed(ch.encode_utf8(&mut buf)));
        }
        events.extend(p.finalize());
        let bytewise = coalesce(events);

        // Ids are minted from a process-wide counter, so compare everything
        // except the minted ids.
        assert_eq!(whole.len(), bytewise.len());
        for (a, b) in whole.iter().zip(bytewise.iter()) {
            match (a, b) {
                (ParserEvent::Text(x), ParserEvent::Text(y)) => assert_eq!(x, y),
                (ParserEvent::GadgetCall(x), ParserEvent::GadgetCall(y)) => {
                    assert_eq!(x.name, y.name);
                    assert_eq!(x.params_raw, y.params_raw);
                    assert_eq!(x.params, y.params);
                    assert_eq!(x.parse_error, y.parse_error);
                    if x.invocation_id == "a1" {
                        assert_eq!(y.invocation_id, "a1");
                    }
                }
                _ => panic!("event kinds diverge: {a:?} vs {b:?}"),
            }
        }
    }

    #[test]
    fn text_before_marker_keeps_trailing_newline() {
        let events = parse_all("line\n!!!GADGET_START:A\n{}\n!!!GADGET_END");
        assert_eq!(events[0], ParserEvent::Text("line\n".into()));
    }

    #[test]
    fn explicit_header_id_is_used() {
        let events = parse_all("!!!GADGET_START:Tool:my-id\n{}\n!!!GADGET_END:my-id");
        let call = events[0].as_call().unwrap();
        assert_eq!(call.invocation_id, "my-id");
    }

    #[test]
    fn end_suffix_with_stray_colon_stays_text() {
        let events = parse_all("!!!GADGET_START:A\n{}\n!!!GADGET_END: not an id");
        assert_eq!(events.len(), 2);
        assert!(events[0].as_call().is_some());
        assert_eq!(events[1], ParserEvent::Text(": not an id".into()));
    }

    #[test]
    fn end_suffix_id_then_text() {
        let events = parse_all("!!!GADGET_START:A:x\n{}\n!!!GADGET_END:x\nafter");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ParserEvent::Text("\nafter".into()));
    }

    #[test]
    fn partial_start_marker_is_retained_not_flushed() {
        let mut p = parser();
        let events = p.feed("hello !!");
        assert_eq!(events, vec![ParserEvent::Text("hello ".into())]);
        let events = p.feed("!GADGET_START:A\n{}\n!!!GADGET_END");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_call().unwrap().name, "A");
    }

    #[test]
    fn partial_marker_that_never_completes_flushes_at_finalize() {
        let mut p = parser();
        assert_eq!(p.feed("tail !!!GA"), vec![ParserEvent::Text("tail ".into())]);
        assert_eq!(p.finalize(), vec![ParserEvent::Text("!!!GA".into())]);
    }

    #[test]
    fn missing_closer_is_lenient_at_finalize() {
        let mut p = parser();
        let events = p.feed("!!!GADGET_START:Sh\n{\"a\":1}");
        assert!(events.is_empty());
        let events = p.finalize();
        let call = events[0].as_call().unwrap();
        assert_eq!(call.name, "Sh");
        assert_eq!(call.params, Some(json!({ "a": 1 })));
    }

    #[test]
    fn header_without_newline_is_lenient_at_finalize() {
        let mut p = parser();
        assert!(p.feed("!!!GADGET_START:Lonely").is_empty());
        let events = p.finalize();
        let call = events[0].as_call().unwrap();
        assert_eq!(call.name, "Lonely");
        assert_eq!(call.params, Some(json!({})));
    }

    #[test]
    fn malformed_header_carries_parse_error() {
        let events = parse_all("!!!GADGET_START:\n{}\n!!!GADGET_END");
        let call = events[0].as_call().unwrap();
        assert!(call.parse_error.as_deref().unwrap().contains("missing gadget name"));
        assert!(call.params.is_none());
    }

    #[test]
    fn body_parse_failure_is_carried_not_fatal() {
        let events = parse_all("!!!GADGET_START:A\n{\"broken\": }\n!!!GADGET_END");
        let call = events[0].as_call().unwrap();
        assert!(call.params.is_none());
        assert!(call.parse_error.is_some());
    }

    #[test]
    fn dependencies_are_harvested_at_parse_time() {
        let events =
            parse_all("!!!GADGET_START:B\n{\"src\":\"@gadget_9\",\"v\":\"$other.out\"}\n!!!GADGET_END");
        let call = events[0].as_call().unwrap();
        let deps: Vec<_> = call.dependencies.iter().cloned().collect();
        assert_eq!(deps, vec!["gadget_9".to_string(), "other".to_string()]);
    }

    #[test]
    fn reset_discards_buffered_state() {
        let mut p = parser();
        let _ = p.feed("!!!GADGET_START:A\npartial");
        p.reset();
        assert!(p.finalize().is_empty());
    }

    #[test]
    fn render_round_trips_through_the_parser() {
        let input = "!!!GADGET_START:Tool:t1\n{\"x\":1}\n!!!GADGET_END:t1";
        let events = parse_all(input);
        let call = events[0].as_call().unwrap();
        assert_eq!(call.render(&MarkerConfig::default()), input);
    }

    #[test]
    fn text_reconstruction_outside_gadgets() {
        // P2 flavor: with explicit ids and suffixed end markers the events
        // reconstruct the exact input.
        let input = "a!!!GADGET_START:T:i\nbody\n!!!GADGET_ENDz";
        let events = coalesce(parse_all(input));
        let mut rebuilt = String::new();
        for event in &events {
            match event {
                ParserEvent::Text(text) => rebuilt.push_str(text),
                ParserEvent::GadgetCall(call) => {
                    rebuilt.push_str("!!!GADGET_START:T:i\n");
                    rebuilt.push_str(&call.params_raw);
                    rebuilt.push_str("!!!GADGET_END");
                }
            }
        }
        assert_eq!(rebuilt, input);
    }
}
