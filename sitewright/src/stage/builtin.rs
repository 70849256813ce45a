//! The built-in stage set registered by every default registry.
//!
//! These cover the glue every site needs: copying sources, parsing them into
//! events, serializing events back out, and the two structural rewrites the
//! engine itself exercises (renaming transforms and section splitting).

use std::io::{Cursor, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::contracts::{MetadataCache, MetadataKey, Source};
use crate::errors::{BuildError, CacheError, ConfigError, StaleError};
use crate::event::{Event, EventParser, EventSink, TextWriterSink, XmlWriterSink};
use crate::stage::{
    AsyncEventTarget, ByteStage, EventStage, StageCore, StageHandle, StageSetup, StreamKind,
    TargetScope,
};

/// Source URLs a producer stage consumed, recorded per concrete source
/// binding and consulted by the stage's staleness check on later passes.
///
/// Keying by the bound URL keeps wildcard expansions independent: each
/// expanded artifact tracks only what its own build read.
struct SourceDeps {
    position: usize,
    cache: Arc<dyn MetadataCache>,
}

impl SourceDeps {
    fn new(setup: &StageSetup) -> Self {
        Self {
            position: setup.position,
            cache: setup.context.metadata(),
        }
    }

    fn key(&self, bound: &str) -> MetadataKey {
        MetadataKey::new(bound, self.position, "sources")
    }

    fn record(&self, url: &str) -> Result<(), BuildError> {
        let key = self.key(url);
        let mut urls: Vec<String> = match self.cache.load(&key)? {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        };
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
            let value = serde_json::to_value(&urls).map_err(CacheError::from)?;
            self.cache.store(&key, value)?;
        }
        Ok(())
    }

    /// True on the first run of a binding or when any recorded source
    /// changed after `since`.
    fn updated_since(
        &self,
        source: &Arc<dyn Source>,
        since: DateTime<Utc>,
    ) -> Result<bool, StaleError> {
        let Ok(bound) = source.source_url() else {
            // Nothing to consult; rebuild and let the build report it.
            return Ok(true);
        };
        let Some(value) = self.cache.load(&self.key(&bound))? else {
            return Ok(true);
        };
        let urls: Vec<String> =
            serde_json::from_value(value).map_err(|err| StaleError::new(err.to_string()))?;
        for url in &urls {
            if source.has_been_updated_since(url, since)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Byte producer copying the artifact's source verbatim.
pub struct SourceStage {
    name: String,
    position: usize,
    deps: SourceDeps,
    source: Arc<dyn Source>,
}

impl SourceStage {
    pub(crate) fn from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        setup.require_no_upstream()?;
        if setup.source.declared_url().is_none() {
            return Err(ConfigError::InitFailed {
                stage: setup.display_name(),
                message: "the owning entry declares no source".to_string(),
            });
        }
        Ok(StageHandle::Bytes(Arc::new(Self {
            name: setup.display_name(),
            position: setup.position,
            deps: SourceDeps::new(&setup),
            source: setup.source,
        })))
    }
}

impl StageCore for SourceStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        None
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.deps.updated_since(&self.source, since)
    }
}

impl ByteStage for SourceStage {
    fn drive(&self, _scope: &dyn TargetScope, out: &mut dyn Write) -> Result<(), BuildError> {
        let url = self.source.source_url()?;
        let mut reader = self.source.open(&url)?;
        let copied = std::io::copy(&mut *reader, out)?;
        debug!(stage = %self.name, %url, bytes = copied, "copied source");
        self.deps.record(&url)
    }
}

/// Event producer reading and parsing the artifact's source.
pub struct ReadStage {
    name: String,
    position: usize,
    deps: SourceDeps,
    source: Arc<dyn Source>,
}

impl ReadStage {
    pub(crate) fn from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        setup.require_no_upstream()?;
        if setup.source.declared_url().is_none() {
            return Err(ConfigError::InitFailed {
                stage: setup.display_name(),
                message: "the owning entry declares no source".to_string(),
            });
        }
        if setup.context.parser().is_none() {
            return Err(ConfigError::NoParser {
                stage: setup.display_name(),
            });
        }
        Ok(StageHandle::Events(Arc::new(Self {
            name: setup.display_name(),
            position: setup.position,
            deps: SourceDeps::new(&setup),
            source: setup.source,
        })))
    }
}

impl StageCore for ReadStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        None
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.deps.updated_since(&self.source, since)
    }
}

impl EventStage for ReadStage {
    fn drive_events(
        &self,
        _scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError> {
        let url = self.source.source_url()?;
        self.source.deliver_events(&url, sink)?;
        debug!(stage = %self.name, %url, "delivered source events");
        self.deps.record(&url)
    }
}

/// Parses an upstream byte stream into events.
pub struct ParseStage {
    name: String,
    position: usize,
    upstream: Arc<dyn ByteStage>,
    parser: Arc<dyn EventParser>,
}

impl ParseStage {
    pub(crate) fn from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        let upstream = setup.upstream_bytes()?;
        let parser = setup.context.parser().ok_or_else(|| ConfigError::NoParser {
            stage: setup.display_name(),
        })?;
        Ok(StageHandle::Events(Arc::new(Self {
            name: setup.display_name(),
            position: setup.position,
            upstream,
            parser,
        })))
    }
}

impl StageCore for ParseStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        Some(StreamKind::Bytes)
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.upstream.has_been_updated(since)
    }
}

impl EventStage for ParseStage {
    fn drive_events(
        &self,
        scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError> {
        // The parser wants a pull source, so the upstream bytes are staged
        // in memory first.
        let mut buffer = Vec::new();
        self.upstream.drive(scope, &mut buffer)?;
        self.parser.parse(&mut Cursor::new(buffer), sink)
    }
}

#[derive(Debug, Clone, Copy)]
enum SerializerKind {
    Xml,
    Text,
}

/// Serializes an event stream into bytes, as XML markup or plain text.
///
/// With `dynamic=true` the stage reports itself permanently stale, forcing a
/// rebuild every pass.
pub struct FormatStage {
    name: String,
    position: usize,
    kind: SerializerKind,
    upstream: Option<Arc<dyn EventStage>>,
    dynamic: bool,
}

impl FormatStage {
    pub(crate) fn xml_from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        Self::build(SerializerKind::Xml, setup)
    }

    pub(crate) fn text_from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        Self::build(SerializerKind::Text, setup)
    }

    fn build(kind: SerializerKind, setup: StageSetup) -> Result<StageHandle, ConfigError> {
        let upstream = setup.upstream_events_optional()?;
        Ok(StageHandle::Bytes(Arc::new(Self {
            name: setup.display_name(),
            position: setup.position,
            kind,
            upstream,
            dynamic: setup.params.get_bool("dynamic", false),
        })))
    }

    fn sink_for<'a>(&self, out: &'a mut dyn Write) -> Box<dyn EventSink + 'a> {
        match self.kind {
            SerializerKind::Xml => Box::new(XmlWriterSink::new(out)),
            SerializerKind::Text => Box::new(TextWriterSink::new(out)),
        }
    }
}

impl StageCore for FormatStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        Some(StreamKind::Events)
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        if self.dynamic {
            return Ok(true);
        }
        match &self.upstream {
            Some(upstream) => upstream.has_been_updated(since),
            None => Ok(false),
        }
    }
}

impl ByteStage for FormatStage {
    fn drive(&self, scope: &dyn TargetScope, out: &mut dyn Write) -> Result<(), BuildError> {
        let upstream = self.upstream.as_ref().ok_or(BuildError::Unsupported {
            operation: "driving a tail serializer without a feed",
        })?;
        let mut sink = self.sink_for(out);
        upstream.drive_events(scope, &mut *sink)
    }

    fn serializer_sink<'a>(
        &'a self,
        _scope: &'a dyn TargetScope,
        out: &'a mut dyn Write,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        Ok(self.sink_for(out))
    }
}

struct RenameSink<S: EventSink> {
    downstream: S,
    old: String,
    new: String,
}

impl<S: EventSink> EventSink for RenameSink<S> {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        let event = match event {
            Event::StartElement { name, attrs } if name == self.old => Event::StartElement {
                name: self.new.clone(),
                attrs,
            },
            Event::EndElement { name } if name == self.old => Event::EndElement {
                name: self.new.clone(),
            },
            other => other,
        };
        self.downstream.handle(event)
    }
}

/// Event-to-event rewrite: passes the stream through, optionally renaming
/// elements (`rename=old=new`).
///
/// A `depends` parameter names an extra URL folded into the staleness check,
/// for transforms whose behavior follows an external resource.
pub struct IdentityTransform {
    name: String,
    position: usize,
    upstream: Option<Arc<dyn EventStage>>,
    rename: Option<(String, String)>,
    depends: Option<String>,
    source: Arc<dyn Source>,
}

impl IdentityTransform {
    pub(crate) fn from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        let upstream = setup.upstream_events_optional()?;
        let rename = match setup.params.get("rename") {
            None => None,
            Some(spec) => match spec.split_once('=') {
                Some((old, new)) if !old.is_empty() && !new.is_empty() => {
                    Some((old.to_string(), new.to_string()))
                }
                _ => {
                    return Err(ConfigError::InitFailed {
                        stage: setup.display_name(),
                        message: format!("rename parameter '{spec}' is not of the form old=new"),
                    })
                }
            },
        };
        let depends = setup.params.get("depends").map(str::to_string);
        Ok(StageHandle::Events(Arc::new(Self {
            name: setup.display_name(),
            position: setup.position,
            upstream,
            rename,
            depends,
            source: setup.source,
        })))
    }
}

impl StageCore for IdentityTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        Some(StreamKind::Events)
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        if let Some(depends) = &self.depends {
            let url = self.source.resolve_relative(depends);
            if self.source.has_been_updated_since(&url, since)? {
                return Ok(true);
            }
        }
        match &self.upstream {
            Some(upstream) => upstream.has_been_updated(since),
            None => Ok(false),
        }
    }
}

impl EventStage for IdentityTransform {
    fn drive_events(
        &self,
        scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError> {
        let upstream = self.upstream.as_ref().ok_or(BuildError::Unsupported {
            operation: "driving a tail transform without a feed",
        })?;
        match &self.rename {
            None => upstream.drive_events(scope, sink),
            Some((old, new)) => {
                let mut renamed = RenameSink {
                    downstream: sink,
                    old: old.clone(),
                    new: new.clone(),
                };
                upstream.drive_events(scope, &mut renamed)
            }
        }
    }

    fn wrap_sink<'a>(
        &'a self,
        _scope: &'a dyn TargetScope,
        downstream: Box<dyn EventSink + 'a>,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        Ok(match &self.rename {
            None => downstream,
            Some((old, new)) => Box::new(RenameSink {
                downstream,
                old: old.clone(),
                new: new.clone(),
            }),
        })
    }
}

#[derive(Debug, Clone)]
enum SplitMode {
    /// Commit the primary target and continue into a new sibling when the
    /// marked element closes.
    Rename,
    /// Siphon each marked element into a secondary target serialized through
    /// the named output on a worker thread.
    Async { output: String },
}

struct ActiveSection {
    target: Box<dyn AsyncEventTarget>,
    depth: usize,
    label: String,
}

struct SplitSink<'a, S: EventSink> {
    downstream: S,
    scope: &'a dyn TargetScope,
    mode: &'a SplitMode,
    at: &'a str,
    target_name: &'a str,
    prepend: bool,
    active: Option<ActiveSection>,
    seq: usize,
}

impl<S: EventSink> SplitSink<'_, S> {
    fn next_name(&mut self) -> String {
        self.seq += 1;
        if self.target_name.contains('*') {
            self.target_name.replace('*', &self.seq.to_string())
        } else {
            self.target_name.to_string()
        }
    }

    fn finish_stream(&mut self) -> Result<(), BuildError> {
        if self.active.is_some() {
            return Err(BuildError::parse(format!(
                "element '{}' not closed before end of stream",
                self.at
            )));
        }
        Ok(())
    }
}

impl<S: EventSink> EventSink for SplitSink<'_, S> {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        if let Some(section) = self.active.as_mut() {
            match &event {
                Event::StartElement { .. } => section.depth += 1,
                Event::EndElement { .. } => section.depth -= 1,
                _ => {}
            }
            let closing = section.depth == 0;
            section.target.handle(event)?;
            if closing {
                let section = self.active.take().ok_or(BuildError::Unsupported {
                    operation: "closing an inactive section",
                })?;
                let mut target = section.target;
                target.handle(Event::EndDocument)?;
                target.finish()?;
                self.downstream
                    .handle(Event::Comment(format!("split:{}", section.label)))?;
            }
            return Ok(());
        }
        match self.mode {
            SplitMode::Async { output } => {
                if let Event::StartElement { name, .. } = &event {
                    if name == self.at {
                        let label = self.next_name();
                        let mut target =
                            self.scope
                                .open_async_event_target(&label, self.prepend, output)?;
                        target.handle(Event::StartDocument)?;
                        target.handle(event)?;
                        self.active = Some(ActiveSection {
                            target,
                            depth: 1,
                            label,
                        });
                        return Ok(());
                    }
                }
            }
            SplitMode::Rename => {
                if let Event::EndElement { name } = &event {
                    if name == self.at {
                        self.downstream.handle(event)?;
                        let next = self.next_name();
                        self.scope.rename_and_continue(&next, self.prepend)?;
                        return Ok(());
                    }
                }
            }
        }
        self.downstream.handle(event)
    }
}

/// Consumes an event stream and splits marked sections out of it.
///
/// `mode=async` serializes each `at` element into its own secondary target
/// through a named output; `mode=rename` commits the running target when the
/// element closes and continues into a new sibling name.
pub struct SplitProcess {
    name: String,
    position: usize,
    upstream: Option<Arc<dyn EventStage>>,
    mode: SplitMode,
    at: String,
    target_name: String,
    prepend: bool,
}

impl SplitProcess {
    pub(crate) fn from_setup(setup: StageSetup) -> Result<StageHandle, ConfigError> {
        let upstream = setup.upstream_events_optional()?;
        let display = setup.display_name();
        let mode = match setup.params.require(&display, "mode")? {
            "rename" => SplitMode::Rename,
            "async" => SplitMode::Async {
                output: setup.params.require(&display, "output")?.to_string(),
            },
            other => {
                return Err(ConfigError::InitFailed {
                    stage: display,
                    message: format!("unknown split mode '{other}'"),
                })
            }
        };
        let at = setup.params.require(&display, "at")?.to_string();
        let target_name = setup.params.require(&display, "name")?.to_string();
        Ok(StageHandle::Events(Arc::new(Self {
            name: display,
            position: setup.position,
            upstream,
            mode,
            at,
            target_name,
            prepend: setup.params.get_bool("prepend", false),
        })))
    }

    fn split_sink<'a, S: EventSink>(&'a self, scope: &'a dyn TargetScope, downstream: S) -> SplitSink<'a, S> {
        SplitSink {
            downstream,
            scope,
            mode: &self.mode,
            at: &self.at,
            target_name: &self.target_name,
            prepend: self.prepend,
            active: None,
            seq: 0,
        }
    }
}

impl StageCore for SplitProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> usize {
        self.position
    }

    fn input_kind(&self) -> Option<StreamKind> {
        Some(StreamKind::Events)
    }

    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        match &self.upstream {
            Some(upstream) => upstream.has_been_updated(since),
            None => Ok(false),
        }
    }
}

impl EventStage for SplitProcess {
    fn drive_events(
        &self,
        scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError> {
        let upstream = self.upstream.as_ref().ok_or(BuildError::Unsupported {
            operation: "driving a tail splitter without a feed",
        })?;
        let mut split = self.split_sink(scope, sink);
        upstream.drive_events(scope, &mut split)?;
        split.finish_stream()
    }

    fn wrap_sink<'a>(
        &'a self,
        scope: &'a dyn TargetScope,
        downstream: Box<dyn EventSink + 'a>,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        Ok(Box::new(self.split_sink(scope, downstream)))
    }
}
