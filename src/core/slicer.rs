use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use serde_json::Value;

use crate::core::document::FragmentDocument;
use crate::core::extractor::{FragmentExtractor, ItemFragment};
use crate::core::template::{
    FieldModifiers, LookupCatalog, LookupTable, MappingSpec, ModifierRegistry, TemplateError,
    TemplateEvaluator,
};
use crate::error::SlicerError;

/// Per-item persistence decision, initialised by the slicer and returned
/// (possibly modified) by the listener's `on_item`.
///
/// An item is processed further only when `include` is true and `id` is
/// resolved; persistence additionally requires a configured `base_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDecision {
    /// Process this item at all. Defaults to false, so a listener must
    /// opt items in.
    pub include: bool,
    /// Persist the raw fragment text as `<id>.xml`.
    pub save_raw_fragment: bool,
    /// Persist the evaluated value tree as `<id>.json`.
    pub save_evaluated_output: bool,
    /// Correlation id, pre-filled from the identifier expression.
    pub id: Option<String>,
}

impl ItemDecision {
    fn with_id(id: Option<String>) -> Self {
        Self {
            include: false,
            save_raw_fragment: false,
            save_evaluated_output: true,
            id,
        }
    }
}

/// Receives the slicer's lifecycle notifications.
///
/// All methods have default no-op implementations; implement only what
/// you need. Per fragment, `on_item` is always raised strictly before
/// `on_evaluated`, and fragments are notified strictly in sequence order.
pub trait SlicerListener {
    /// Raised once per extracted fragment, before template evaluation.
    /// The returned decision controls downstream processing.
    fn on_item(
        &mut self,
        _fragment: &ItemFragment,
        _doc: &FragmentDocument,
        decision: ItemDecision,
    ) -> ItemDecision {
        decision
    }

    /// Raised once per included fragment with a resolved id, after
    /// template evaluation.
    fn on_evaluated(&mut self, _index: usize, _tree: &Value) {}

    /// Raised for every non-fatal per-field error during evaluation.
    fn on_template_error(&mut self, _index: usize, _error: &TemplateError) {}

    /// Raised when a fragment cannot be parsed, an identifier expression
    /// fails, or the delimiter pattern matches an empty span. Processing
    /// continues after each.
    fn on_parse_error(&mut self, _index: usize, _error: &SlicerError) {}
}

/// A builder for configuring an [`XmlSlicer`].
///
/// `build()` compiles the delimiter pattern and loads the lookup catalog,
/// so configuration errors surface before any data is fed.
///
/// # Examples
///
/// ```
/// use xml_slicer::core::slicer::XmlSlicerBuilder;
/// use xml_slicer::core::template::MappingSpec;
///
/// let slicer = XmlSlicerBuilder::new()
///     .pattern(r"<Item(.|\n|\r)*?</Item>")
///     .identifier("@ItemID")
///     .item_type("accommodation")
///     .mapping(MappingSpec::new().field("name", "required:Name"))
///     .build()
///     .unwrap();
/// # let _ = slicer;
/// ```
pub struct XmlSlicerBuilder {
    pattern: Option<String>,
    identifier: Option<String>,
    item_type: Option<String>,
    mapping: Option<MappingSpec>,
    registry: ModifierRegistry,
    extra_tables: Vec<(String, LookupTable)>,
    lookup_dir: PathBuf,
    base_path: Option<PathBuf>,
    capacity: usize,
}

impl Default for XmlSlicerBuilder {
    fn default() -> Self {
        Self {
            pattern: None,
            identifier: None,
            item_type: None,
            mapping: None,
            registry: ModifierRegistry::with_defaults(),
            extra_tables: Vec::new(),
            lookup_dir: PathBuf::from("lookups"),
            base_path: None,
            capacity: 8192,
        }
    }
}

impl XmlSlicerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delimiter pattern identifying one item's textual span
    /// within the stream. Required.
    pub fn pattern<S: AsRef<str>>(mut self, pattern: S) -> Self {
        self.pattern = Some(pattern.as_ref().to_string());
        self
    }

    /// Sets the query expression evaluated per fragment to produce a
    /// correlation id.
    pub fn identifier<S: AsRef<str>>(mut self, expr: S) -> Self {
        self.identifier = Some(expr.as_ref().to_string());
        self
    }

    /// Sets the namespace string used to select the lookup-table resource
    /// and the output subdirectory.
    pub fn item_type<S: AsRef<str>>(mut self, item_type: S) -> Self {
        self.item_type = Some(item_type.as_ref().to_string());
        self
    }

    /// Sets the field-mapping tree evaluated per fragment.
    pub fn mapping(mut self, spec: MappingSpec) -> Self {
        self.mapping = Some(spec);
        self
    }

    /// Adds or overrides a modifier handler. Caller entries take
    /// precedence over the built-ins on name collision.
    pub fn modifier_handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut FieldModifiers, Option<&str>) -> Result<(), String> + 'static,
    {
        self.registry.register(name, handler);
        self
    }

    /// Directory holding `<item_type>.json` lookup resources. A missing
    /// resource is not an error; an empty catalog is used.
    pub fn lookup_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.lookup_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Registers a lookup table directly, in addition to (and overriding)
    /// the tables loaded from the lookup resource.
    pub fn lookup_table(mut self, name: impl Into<String>, table: LookupTable) -> Self {
        self.extra_tables.push((name.into(), table));
        self
    }

    /// Output directory for persisted items. Persistence only happens
    /// when this is configured.
    pub fn base_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.base_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Read-buffer capacity used by `import_file`.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<XmlSlicer, SlicerError> {
        let pattern = self
            .pattern
            .ok_or_else(|| SlicerError::InvalidPattern("no delimiter pattern set".to_string()))?;
        let extractor = FragmentExtractor::new(&pattern)?;

        let mut lookups = match &self.item_type {
            Some(item_type) => load_lookups(&self.lookup_dir.join(format!("{}.json", item_type)))?,
            None => LookupCatalog::default(),
        };
        for (name, table) in self.extra_tables {
            lookups.insert(name, table);
        }

        Ok(XmlSlicer {
            extractor,
            identifier: self.identifier,
            item_type: self.item_type,
            mapping: self.mapping,
            evaluator: TemplateEvaluator::new(self.registry, lookups),
            base_path: self.base_path,
            capacity: self.capacity,
        })
    }
}

/// Loads the named-table resource for one item type. Absence of the file
/// yields an empty catalog.
fn load_lookups(path: &Path) -> Result<LookupCatalog, SlicerError> {
    if !path.exists() {
        debug!("no lookup resource at {}", path.display());
        return Ok(LookupCatalog::default());
    }

    let resource = |message: String| SlicerError::LookupResource {
        path: path.display().to_string(),
        message,
    };

    let file = File::open(path).map_err(|e| resource(e.to_string()))?;
    let tables: HashMap<String, LookupTable> =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| resource(e.to_string()))?;

    debug!("loaded {} lookup tables from {}", tables.len(), path.display());
    Ok(LookupCatalog::new(tables))
}

/// Drives the slicing pipeline: extraction, fragment parsing, template
/// evaluation, notifications and optional persistence.
///
/// The slicer is push-driven and single-threaded: each `feed` call
/// processes its chunk to completion, including all notifications and
/// persistence for every fragment it completes, before returning. The
/// only `Err` returns are environmental (unreadable source, unwritable
/// output); content-level problems surface as listener notifications and
/// never abort the stream.
///
/// # Examples
///
/// ```
/// use serde_json::Value;
/// use xml_slicer::{
///     FragmentDocument, ItemDecision, ItemFragment, MappingSpec, SlicerListener,
///     XmlSlicerBuilder,
/// };
///
/// #[derive(Default)]
/// struct Collect {
///     trees: Vec<Value>,
/// }
///
/// impl SlicerListener for Collect {
///     fn on_item(
///         &mut self,
///         _fragment: &ItemFragment,
///         _doc: &FragmentDocument,
///         mut decision: ItemDecision,
///     ) -> ItemDecision {
///         decision.include = true;
///         decision
///     }
///
///     fn on_evaluated(&mut self, _index: usize, tree: &Value) {
///         self.trees.push(tree.clone());
///     }
/// }
///
/// let mut slicer = XmlSlicerBuilder::new()
///     .pattern(r"<Item(.|\n|\r)*?</Item>")
///     .identifier("@ItemID")
///     .mapping(MappingSpec::new().field("name", "Name"))
///     .build()
///     .unwrap();
///
/// let mut listener = Collect::default();
/// slicer
///     .feed(r#"<x><Item ItemID="1"><Name>A</Name></Item>"#, &mut listener)
///     .unwrap();
/// slicer.finish(&mut listener).unwrap();
///
/// assert_eq!(listener.trees.len(), 1);
/// assert_eq!(listener.trees[0]["name"], "A");
/// ```
pub struct XmlSlicer {
    extractor: FragmentExtractor,
    identifier: Option<String>,
    item_type: Option<String>,
    mapping: Option<MappingSpec>,
    evaluator: TemplateEvaluator,
    base_path: Option<PathBuf>,
    capacity: usize,
}

impl XmlSlicer {
    /// Feeds one chunk of stream text, processing every fragment it
    /// completes.
    pub fn feed<L: SlicerListener>(
        &mut self,
        chunk: &str,
        listener: &mut L,
    ) -> Result<(), SlicerError> {
        let fragments = match self.extractor.feed(chunk) {
            Ok(fragments) => fragments,
            Err(config_error) => {
                warn!("extraction halted: {}", config_error);
                listener.on_parse_error(self.extractor.sequence(), &config_error);
                return Ok(());
            }
        };

        for fragment in fragments {
            self.process_fragment(fragment, listener)?;
        }
        Ok(())
    }

    /// Flushes the stream at end-of-input.
    pub fn finish<L: SlicerListener>(&mut self, listener: &mut L) -> Result<(), SlicerError> {
        let fragments = match self.extractor.finish() {
            Ok(fragments) => fragments,
            Err(config_error) => {
                listener.on_parse_error(self.extractor.sequence(), &config_error);
                return Ok(());
            }
        };

        for fragment in fragments {
            self.process_fragment(fragment, listener)?;
        }
        debug!("stream finished, residual {} bytes", self.residual().len());
        Ok(())
    }

    /// Unconsumed stream suffix retained by the extractor.
    pub fn residual(&self) -> &str {
        self.extractor.residual()
    }

    /// Streams a file through the slicer in fixed-size chunks, calling
    /// `finish` at end-of-file.
    ///
    /// Chunk boundaries may fall inside a multi-byte UTF-8 sequence; the
    /// incomplete tail is carried over to the next chunk. Read failures
    /// and invalid UTF-8 surface as [`SlicerError::SourceRead`].
    pub fn import_file<L: SlicerListener, P: AsRef<Path>>(
        &mut self,
        path: P,
        listener: &mut L,
    ) -> Result<(), SlicerError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            error!("failed to open source {}: {}", path.display(), e);
            SlicerError::SourceRead(format!("{}: {}", path.display(), e))
        })?;

        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; self.capacity];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            let read = reader
                .read(&mut buf)
                .map_err(|e| SlicerError::SourceRead(e.to_string()))?;
            if read == 0 {
                break;
            }
            carry.extend_from_slice(&buf[..read]);

            let (valid_len, invalid) = match std::str::from_utf8(&carry) {
                Ok(_) => (carry.len(), false),
                Err(e) => (e.valid_up_to(), e.error_len().is_some()),
            };

            if let Ok(chunk) = std::str::from_utf8(&carry[..valid_len]) {
                self.feed(chunk, listener)?;
            }
            carry.drain(..valid_len);

            if invalid {
                return Err(SlicerError::SourceRead(
                    "source is not valid UTF-8".to_string(),
                ));
            }
        }

        if !carry.is_empty() {
            return Err(SlicerError::SourceRead(
                "source ends inside a UTF-8 sequence".to_string(),
            ));
        }

        self.finish(listener)
    }

    fn process_fragment<L: SlicerListener>(
        &self,
        fragment: ItemFragment,
        listener: &mut L,
    ) -> Result<(), SlicerError> {
        debug!("fragment {} extracted", fragment.index);

        let doc = match FragmentDocument::parse(&fragment.text) {
            Ok(doc) => doc,
            Err(parse_error) => {
                warn!("fragment {} skipped: {}", fragment.index, parse_error);
                listener.on_parse_error(fragment.index, &parse_error);
                return Ok(());
            }
        };

        let id = match &self.identifier {
            Some(expr) => match doc.identifier(expr) {
                Ok(id) => id,
                Err(expr_error) => {
                    listener.on_parse_error(fragment.index, &expr_error);
                    None
                }
            },
            None => None,
        };

        let decision = listener.on_item(&fragment, &doc, ItemDecision::with_id(id));
        if !decision.include {
            return Ok(());
        }
        let Some(id) = decision.id.as_deref() else {
            return Ok(());
        };

        if let Some(spec) = &self.mapping {
            let index = fragment.index;
            let tree = self.evaluator.evaluate(spec, &doc, &mut |template_error: TemplateError| {
                warn!("fragment {}: {}", index, template_error);
                listener.on_template_error(index, &template_error);
            });
            listener.on_evaluated(fragment.index, &tree);

            if decision.save_evaluated_output {
                let payload = serde_json::to_vec_pretty(&tree)
                    .map_err(|e| SlicerError::OutputWrite {
                        path: id.to_string(),
                        message: e.to_string(),
                    })?;
                self.persist(id, "json", &payload)?;
            }
        }

        if decision.save_raw_fragment {
            self.persist(id, "xml", fragment.text.as_bytes())?;
        }

        Ok(())
    }

    /// Writes one output file under `<base_path>/<item_type>/<id>.<ext>`,
    /// creating directories as needed. A missing `base_path` disables
    /// persistence entirely.
    fn persist(&self, id: &str, extension: &str, payload: &[u8]) -> Result<(), SlicerError> {
        let Some(base) = &self.base_path else {
            return Ok(());
        };

        let dir = match &self.item_type {
            Some(item_type) => base.join(item_type),
            None => base.clone(),
        };
        let path = dir.join(format!("{}.{}", id, extension));
        let write_error = |message: String| SlicerError::OutputWrite {
            path: path.display().to_string(),
            message,
        };

        fs::create_dir_all(&dir).map_err(|e| write_error(e.to_string()))?;
        fs::write(&path, payload).map_err(|e| write_error(e.to_string()))?;

        debug!("persisted {}", path.display());
        Ok(())
    }
}
