//! Incremental response handling shared by every streaming backend.
//!
//! A backend body is split into lines, each line is decoded into
//! [`StreamRecord`]s by a backend-specific [`StreamDecoder`], and the
//! [`StreamAggregator`] republishes text deltas while accumulating the final
//! assistant message. Lines that fail to decode are skipped.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PlexusError, PlexusErrorCode};
use crate::types::{Conversation, Message};
use crate::usage::{account, RawUsage, UsageStats};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Delta(String),
    Usage(RawUsage),
    Done,
}

pub trait StreamDecoder: Send {
    /// Decodes one body line. `None` marks a malformed record.
    fn decode_line(&mut self, line: &str) -> Option<Vec<StreamRecord>>;
}

/// Splits arbitrary byte chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=position).collect::<Vec<_>>();
            lines.push(decode_line_bytes(&line));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line_bytes(&line))
    }
}

fn decode_line_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

pub struct StreamAggregator {
    decoder: Box<dyn StreamDecoder>,
    content: String,
    fragments: usize,
    skipped: usize,
    usage: RawUsage,
    prompt_elapsed: Duration,
    completion_started: Instant,
    settled_usage: Option<UsageStats>,
    done: bool,
}

impl StreamAggregator {
    /// `prompt_elapsed` covers the request up to the response headers; the
    /// completion clock starts now.
    pub fn new(decoder: Box<dyn StreamDecoder>, prompt_elapsed: Duration) -> Self {
        Self {
            decoder,
            content: String::new(),
            fragments: 0,
            skipped: 0,
            usage: RawUsage::default(),
            prompt_elapsed,
            completion_started: Instant::now(),
            settled_usage: None,
            done: false,
        }
    }

    /// Uses already-accounted usage instead of timing this stream.
    pub fn with_settled_usage(mut self, usage: UsageStats) -> Self {
        self.settled_usage = Some(usage);
        self
    }

    /// Feeds one line and returns the text fragments it produced.
    pub fn accept_line(&mut self, line: &str) -> Vec<String> {
        if self.done || line.trim().is_empty() {
            return Vec::new();
        }

        let Some(records) = self.decoder.decode_line(line) else {
            self.skipped += 1;
            warn!(line = %line, "skipping malformed stream record");
            return Vec::new();
        };

        let mut fragments = Vec::new();
        for record in records {
            match record {
                StreamRecord::Delta(delta) => {
                    if !delta.is_empty() {
                        self.push_fragment(&delta);
                        fragments.push(delta);
                    }
                }
                StreamRecord::Usage(usage) => self.merge_usage(usage),
                StreamRecord::Done => self.done = true,
            }
        }
        fragments
    }

    pub fn push_fragment(&mut self, fragment: &str) {
        self.content.push_str(fragment);
        self.fragments += 1;
    }

    pub fn merge_usage(&mut self, usage: RawUsage) {
        self.usage.merge(usage);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    /// Builds the single assistant message for the whole stream, empty when no
    /// fragment arrived.
    pub fn into_message(self) -> Message {
        debug!(
            fragments = self.fragments,
            skipped = self.skipped,
            "stream aggregated"
        );
        let usage = self.settled_usage.unwrap_or_else(|| {
            account(
                &self.usage,
                self.prompt_elapsed,
                self.completion_started.elapsed(),
            )
        });
        Message::assistant(self.content).with_usage(usage)
    }
}

/// Decoder for streams that are produced locally and never see a wire line.
struct NoopDecoder;

impl StreamDecoder for NoopDecoder {
    fn decode_line(&mut self, _line: &str) -> Option<Vec<StreamRecord>> {
        Some(Vec::new())
    }
}

fn ready_aggregator(fragments: &[String], usage: Option<UsageStats>) -> StreamAggregator {
    let mut aggregator = StreamAggregator::new(Box::new(NoopDecoder), Duration::ZERO);
    if let Some(usage) = usage {
        aggregator = aggregator.with_settled_usage(usage);
    }
    for fragment in fragments {
        aggregator.push_fragment(fragment);
    }
    aggregator
}

fn stream_read_error(error: impl std::fmt::Display) -> PlexusError {
    PlexusError::new(
        PlexusErrorCode::ProviderTransport,
        format!("stream read failed: {error}"),
    )
}

/// Blocking, forward-only sequence of text fragments.
///
/// Once the iterator returns `None`, the concatenated text has been appended
/// to the conversation as one assistant message. Dropping the iterator early
/// or hitting a read error appends nothing. A fresh call to the adapter is
/// needed to read the response again.
pub struct BlockingTextStream<'a> {
    reader: Option<BufReader<Box<dyn Read + Send>>>,
    aggregator: Option<StreamAggregator>,
    pending: VecDeque<String>,
    conversation: &'a mut Conversation,
    line: Vec<u8>,
}

impl<'a> BlockingTextStream<'a> {
    pub fn new(
        reader: Box<dyn Read + Send>,
        aggregator: StreamAggregator,
        conversation: &'a mut Conversation,
    ) -> Self {
        Self {
            reader: Some(BufReader::new(reader)),
            aggregator: Some(aggregator),
            pending: VecDeque::new(),
            conversation,
            line: Vec::new(),
        }
    }

    /// A stream whose fragments are already known, such as a tool round that
    /// answered without calling a tool.
    pub fn ready(
        fragments: Vec<String>,
        usage: Option<UsageStats>,
        conversation: &'a mut Conversation,
    ) -> Self {
        let aggregator = ready_aggregator(&fragments, usage);
        Self {
            reader: None,
            aggregator: Some(aggregator),
            pending: fragments.into(),
            conversation,
            line: Vec::new(),
        }
    }

    /// Drains the remaining fragments and returns the full text.
    pub fn collect_text(self) -> Result<String, PlexusError> {
        let mut text = String::new();
        for fragment in self {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    fn complete(&mut self) {
        self.reader = None;
        if let Some(aggregator) = self.aggregator.take() {
            self.conversation.append(aggregator.into_message());
        }
    }

    fn abort(&mut self) {
        self.reader = None;
        self.aggregator = None;
        self.pending.clear();
    }
}

impl Iterator for BlockingTextStream<'_> {
    type Item = Result<String, PlexusError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            let Some(aggregator) = self.aggregator.as_mut() else {
                return None;
            };
            let Some(reader) = self.reader.as_mut() else {
                self.complete();
                return None;
            };
            if aggregator.is_done() {
                self.complete();
                return None;
            }

            // Raw bytes, so a line that is not UTF-8 is skipped by the
            // decoder instead of failing the read.
            self.line.clear();
            match reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.complete();
                    return None;
                }
                Ok(_) => {
                    let line = decode_line_bytes(&self.line);
                    let fragments = aggregator.accept_line(&line);
                    self.pending.extend(fragments);
                }
                Err(error) => {
                    self.abort();
                    return Some(Err(stream_read_error(error)));
                }
            }
        }
    }
}

/// Async, forward-only sequence of text fragments. Each call to
/// [`TextStream::next`] suspends only while reading from the network.
///
/// Same completion contract as [`BlockingTextStream`]: the assistant message is
/// appended once `next` has returned `None`.
pub struct TextStream<'a> {
    response: Option<reqwest::Response>,
    lines: LineBuffer,
    aggregator: Option<StreamAggregator>,
    pending: VecDeque<String>,
    conversation: &'a mut Conversation,
}

impl<'a> TextStream<'a> {
    pub fn new(
        response: reqwest::Response,
        aggregator: StreamAggregator,
        conversation: &'a mut Conversation,
    ) -> Self {
        Self {
            response: Some(response),
            lines: LineBuffer::new(),
            aggregator: Some(aggregator),
            pending: VecDeque::new(),
            conversation,
        }
    }

    pub fn ready(
        fragments: Vec<String>,
        usage: Option<UsageStats>,
        conversation: &'a mut Conversation,
    ) -> Self {
        let aggregator = ready_aggregator(&fragments, usage);
        Self {
            response: None,
            lines: LineBuffer::new(),
            aggregator: Some(aggregator),
            pending: fragments.into(),
            conversation,
        }
    }

    pub async fn next(&mut self) -> Option<Result<String, PlexusError>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            let aggregator = self.aggregator.as_mut()?;
            let Some(response) = self.response.as_mut() else {
                self.complete();
                return None;
            };
            if aggregator.is_done() {
                self.complete();
                return None;
            }

            match response.chunk().await {
                Ok(Some(chunk)) => {
                    for line in self.lines.push(&chunk) {
                        let fragments = aggregator.accept_line(&line);
                        self.pending.extend(fragments);
                    }
                }
                Ok(None) => {
                    if let Some(line) = self.lines.finish() {
                        let fragments = aggregator.accept_line(&line);
                        self.pending.extend(fragments);
                    }
                    self.response = None;
                }
                Err(error) => {
                    self.abort();
                    return Some(Err(stream_read_error(error)));
                }
            }
        }
    }

    pub async fn collect_text(mut self) -> Result<String, PlexusError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    fn complete(&mut self) {
        self.response = None;
        if let Some(aggregator) = self.aggregator.take() {
            self.conversation.append(aggregator.into_message());
        }
    }

    fn abort(&mut self) {
        self.response = None;
        self.aggregator = None;
        self.pending.clear();
    }
}
