use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::core::document::FragmentDocument;

/// A flag-like prefix is an identifier followed by a parenthesized
/// argument, a `.`/`:` delimiter, or both. Path expressions such as
/// `/root/a` or `Name` never match, so they are left untouched.
static FLAG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\(([^()]*)\)[.:]?|[.:])").unwrap()
});

/// Classification of a per-field soft error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateErrorKind {
    /// Unknown modifier token, or a modifier used with invalid syntax.
    Configuration,
    /// The query expression could not be evaluated.
    Query,
    /// A value had no entry in its lookup table; the raw value was kept.
    LookupMiss,
    /// A `required` expression matched no nodes.
    RequiredMissing,
    /// A value could not be coerced to the requested type; the raw value
    /// was kept.
    Coercion,
}

/// A non-fatal error raised while evaluating one field of a mapping
/// specification. Evaluation always continues with the remaining fields.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("field `{field}` ({expression}): {message}")]
pub struct TemplateError {
    pub kind: TemplateErrorKind,
    /// Dotted path of the offending field within the specification.
    pub field: String,
    /// The leaf expression the field was declared with.
    pub expression: String,
    pub message: String,
}

/// Converts one raw extracted string into an output value; `None` means
/// the value could not be converted.
pub type ValueConverter = Rc<dyn Fn(&str) -> Option<Value>>;

/// Accumulated interpretation flags for one leaf expression.
#[derive(Default, Clone)]
pub struct FieldModifiers {
    /// Force an array result even for a single match.
    pub multi: bool,
    /// An empty match sequence is an error.
    pub required: bool,
    /// Type coercion applied to every value.
    pub converter: Option<ValueConverter>,
    /// Name of the lookup table to substitute values through.
    pub lookup: Option<String>,
}

/// A modifier handler mutates the accumulating flag set. It receives the
/// parenthesized argument when the token carried one, and fails with a
/// message on invalid syntax (reported as a configuration error).
pub type ModifierHandler = Rc<dyn Fn(&mut FieldModifiers, Option<&str>) -> Result<(), String>>;

/// Immutable registry of modifier handlers, built once per slicer
/// instance: builtin defaults layered under caller overrides, caller
/// entries taking precedence on name collision. Never mutated after
/// construction.
#[derive(Clone)]
pub struct ModifierRegistry {
    handlers: HashMap<String, ModifierHandler>,
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ModifierRegistry {
    /// Registry holding the built-in handlers: `multi`, `float`, `int`,
    /// `boolean`, `lookup`, `required`.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };

        registry.register("multi", |flags, _| {
            flags.multi = true;
            Ok(())
        });
        registry.register("required", |flags, _| {
            flags.required = true;
            Ok(())
        });
        registry.register("float", |flags, _| {
            flags.converter = Some(Rc::new(|raw| {
                raw.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
            }));
            Ok(())
        });
        registry.register("int", |flags, _| {
            flags.converter = Some(Rc::new(|raw| {
                raw.parse::<i64>().ok().map(Value::from)
            }));
            Ok(())
        });
        registry.register("boolean", |flags, _| {
            flags.converter = Some(Rc::new(|raw| Some(Value::Bool(!raw.is_empty()))));
            Ok(())
        });
        registry.register("lookup", |flags, argument| match argument {
            Some(name) if !name.is_empty() => {
                flags.lookup = Some(name.to_string());
                Ok(())
            }
            _ => Err("lookup requires a table name argument, e.g. lookup(region)".to_string()),
        });

        registry
    }

    /// Registers a handler, replacing any existing entry with this name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut FieldModifiers, Option<&str>) -> Result<(), String> + 'static,
    {
        self.handlers.insert(name.into(), Rc::new(handler));
    }

    /// Strips the modifier chain off the front of `expr`.
    ///
    /// Returns the accumulated flag set and the remaining query expression.
    /// A flag-like token with no registered handler is reported through
    /// `report` and stripping continues; modifiers are order-independent.
    pub fn parse<'a>(
        &self,
        expr: &'a str,
        report: &mut dyn FnMut(TemplateErrorKind, String),
    ) -> (FieldModifiers, &'a str) {
        let mut flags = FieldModifiers::default();
        let mut rest = expr;

        while let Some(captures) = FLAG_PREFIX.captures(rest) {
            let token = &captures[1];
            let argument = captures.get(2).map(|m| m.as_str());

            match self.handlers.get(token) {
                Some(handler) => {
                    if let Err(message) = handler.as_ref()(&mut flags, argument) {
                        report(TemplateErrorKind::Configuration, message);
                    }
                }
                None => {
                    report(
                        TemplateErrorKind::Configuration,
                        format!("expression flag `{}` has no registered handler", token),
                    );
                }
            }

            rest = &rest[captures.get(0).map_or(0, |m| m.end())..];
        }

        (flags, rest)
    }
}

/// A named string-to-string substitution table.
pub type LookupTable = HashMap<String, String>;

/// The set of named lookup tables available to one slicer instance,
/// loaded once at construction and shared read-only across evaluations.
/// A missing named table behaves as an empty table.
#[derive(Debug, Default, Clone)]
pub struct LookupCatalog {
    tables: HashMap<String, LookupTable>,
}

impl LookupCatalog {
    pub fn new(tables: HashMap<String, LookupTable>) -> Self {
        Self { tables }
    }

    pub fn insert(&mut self, name: impl Into<String>, table: LookupTable) {
        self.tables.insert(name.into(), table);
    }

    pub fn get(&self, name: &str, key: &str) -> Option<&str> {
        self.tables.get(name)?.get(key).map(String::as_str)
    }
}

/// One field of a mapping specification.
pub enum MappingField {
    /// A modifier-annotated query expression.
    Expression(String),
    /// A nested specification, producing a nested object.
    Nested(MappingSpec),
    /// A custom transform invoked with the fragment's document; its return
    /// value is adopted directly, bypassing query and modifier logic.
    Computed(Box<dyn Fn(&FragmentDocument) -> Value>),
}

/// The declarative tree describing how to derive an output value tree
/// from a fragment's document. Immutable; the same specification is
/// reused across all fragments. Fields evaluate in declared order.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use xml_slicer::core::template::MappingSpec;
///
/// let spec = MappingSpec::new()
///     .field("id", "@ItemID")
///     .field("name", "required://Item/@Name")
///     .nested(
///         "pos",
///         MappingSpec::new()
///             .field("lat", "float://Item/@Latitude")
///             .field("lon", "float://Item/@Longitude"),
///     )
///     .computed("kind", |_doc| json!("place"));
/// assert_eq!(spec.len(), 4);
/// ```
#[derive(Default)]
pub struct MappingSpec {
    fields: Vec<(String, MappingField)>,
}

impl MappingSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query-expression field.
    pub fn field(mut self, key: impl Into<String>, expression: impl Into<String>) -> Self {
        self.fields
            .push((key.into(), MappingField::Expression(expression.into())));
        self
    }

    /// Adds a nested specification.
    pub fn nested(mut self, key: impl Into<String>, spec: MappingSpec) -> Self {
        self.fields.push((key.into(), MappingField::Nested(spec)));
        self
    }

    /// Adds a custom computed field.
    pub fn computed<F>(mut self, key: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&FragmentDocument) -> Value + 'static,
    {
        self.fields
            .push((key.into(), MappingField::Computed(Box::new(transform))));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, MappingField)] {
        &self.fields
    }
}

/// Walks a mapping specification over a fragment document and produces a
/// nested value tree.
///
/// Evaluation never aborts: every failure is delivered to the
/// caller-supplied `report` callback and the remaining fields are still
/// evaluated.
pub struct TemplateEvaluator {
    registry: ModifierRegistry,
    lookups: LookupCatalog,
}

impl TemplateEvaluator {
    pub fn new(registry: ModifierRegistry, lookups: LookupCatalog) -> Self {
        Self { registry, lookups }
    }

    pub fn evaluate(
        &self,
        spec: &MappingSpec,
        doc: &FragmentDocument,
        report: &mut dyn FnMut(TemplateError),
    ) -> Value {
        Value::Object(self.evaluate_spec(spec, doc, "", report))
    }

    fn evaluate_spec(
        &self,
        spec: &MappingSpec,
        doc: &FragmentDocument,
        prefix: &str,
        report: &mut dyn FnMut(TemplateError),
    ) -> Map<String, Value> {
        let mut tree = Map::new();

        for (key, field) in spec.fields() {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };

            match field {
                MappingField::Nested(nested) => {
                    let value = self.evaluate_spec(nested, doc, &path, report);
                    tree.insert(key.clone(), Value::Object(value));
                }
                MappingField::Computed(transform) => {
                    tree.insert(key.clone(), transform(doc));
                }
                MappingField::Expression(expression) => {
                    if let Some(value) = self.evaluate_expression(expression, doc, &path, report) {
                        tree.insert(key.clone(), value);
                    }
                }
            }
        }

        tree
    }

    fn evaluate_expression(
        &self,
        expression: &str,
        doc: &FragmentDocument,
        field: &str,
        report: &mut dyn FnMut(TemplateError),
    ) -> Option<Value> {
        let error = |kind: TemplateErrorKind, message: String| TemplateError {
            kind,
            field: field.to_string(),
            expression: expression.to_string(),
            message,
        };

        let (flags, query_expr) = {
            let mut forward =
                |kind: TemplateErrorKind, message: String| report(error(kind, message));
            self.registry.parse(expression, &mut forward)
        };

        let raw = match doc.query(query_expr) {
            Ok(values) => values,
            Err(query_error) => {
                report(error(TemplateErrorKind::Query, query_error.to_string()));
                return None;
            }
        };

        let mut values = Vec::with_capacity(raw.len());
        for value in raw {
            // Lookup substitution first; a miss keeps the raw value.
            let substituted = match &flags.lookup {
                Some(table) => match self.lookups.get(table, &value) {
                    Some(mapped) => mapped.to_string(),
                    None => {
                        report(error(
                            TemplateErrorKind::LookupMiss,
                            format!("value `{}` not found in lookup `{}`", value, table),
                        ));
                        value
                    }
                },
                None => value,
            };

            let converted = match &flags.converter {
                Some(converter) => match converter.as_ref()(&substituted) {
                    Some(value) => value,
                    None => {
                        report(error(
                            TemplateErrorKind::Coercion,
                            format!("value `{}` could not be coerced", substituted),
                        ));
                        Value::String(substituted)
                    }
                },
                None => Value::String(substituted),
            };

            values.push(converted);
        }

        if flags.required && values.is_empty() {
            report(error(
                TemplateErrorKind::RequiredMissing,
                format!("expression `{}` matched nothing but is required", query_expr),
            ));
        }

        if flags.multi || values.len() > 1 {
            Some(Value::Array(values))
        } else {
            values.into_iter().next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(expr: &str) -> (FieldModifiers, String, Vec<(TemplateErrorKind, String)>) {
        let registry = ModifierRegistry::with_defaults();
        let mut errors = Vec::new();
        let (flags, rest) = registry.parse(expr, &mut |kind, message| errors.push((kind, message)));
        (flags, rest.to_string(), errors)
    }

    fn evaluator_with(tables: &[(&str, &[(&str, &str)])]) -> TemplateEvaluator {
        let mut catalog = LookupCatalog::default();
        for (name, entries) in tables {
            let table = entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            catalog.insert(*name, table);
        }
        TemplateEvaluator::new(ModifierRegistry::with_defaults(), catalog)
    }

    fn evaluate(
        evaluator: &TemplateEvaluator,
        spec: &MappingSpec,
        xml: &str,
    ) -> (Value, Vec<TemplateError>) {
        let doc = FragmentDocument::parse(xml).unwrap();
        let mut errors = Vec::new();
        let tree = evaluator.evaluate(spec, &doc, &mut |e| errors.push(e));
        (tree, errors)
    }

    #[test]
    fn test_modifier_order_does_not_matter() {
        let (a, rest_a, errors_a) = parse("required.float://Item/@Latitude");
        let (b, rest_b, errors_b) = parse("float.required://Item/@Latitude");

        assert_eq!(rest_a, "//Item/@Latitude");
        assert_eq!(rest_b, "//Item/@Latitude");
        assert!(errors_a.is_empty());
        assert!(errors_b.is_empty());
        for flags in [&a, &b] {
            assert!(flags.required);
            assert!(!flags.multi);
            assert!(flags.lookup.is_none());
            let converter = flags.converter.as_ref().unwrap();
            assert_eq!(converter.as_ref()("1.5"), Some(json!(1.5)));
        }
    }

    #[test]
    fn test_lookup_modifier_consumes_its_argument() {
        let (flags, rest, errors) = parse("multi:lookup(region)//Item/Region");
        assert!(flags.multi);
        assert_eq!(flags.lookup.as_deref(), Some("region"));
        assert_eq!(rest, "//Item/Region");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_lookup_without_argument_is_a_configuration_error() {
        let (flags, rest, errors) = parse("lookup://Item/Region");
        assert!(flags.lookup.is_none());
        assert_eq!(rest, "//Item/Region");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, TemplateErrorKind::Configuration);
    }

    #[test]
    fn test_unknown_flag_reports_and_stripping_continues() {
        let (flags, rest, errors) = parse("frob:required://X");
        assert!(flags.required);
        assert_eq!(rest, "//X");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, TemplateErrorKind::Configuration);
        assert!(errors[0].1.contains("frob"));
    }

    #[test]
    fn test_paths_are_not_mistaken_for_flag_chains() {
        let (flags, rest, errors) = parse("/root/a.b");
        assert!(rest == "/root/a.b");
        assert!(!flags.multi && !flags.required);
        assert!(flags.converter.is_none() && flags.lookup.is_none());
        assert!(errors.is_empty());

        let (_, rest, errors) = parse("Name");
        assert_eq!(rest, "Name");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_caller_handlers_override_builtins() {
        let mut registry = ModifierRegistry::with_defaults();
        registry.register("float", |flags, _| {
            // Overridden to mark the field required instead.
            flags.required = true;
            Ok(())
        });

        let mut errors = Vec::new();
        let (flags, rest) = registry.parse("float:Name", &mut |kind, m| errors.push((kind, m)));
        assert!(flags.required);
        assert!(flags.converter.is_none());
        assert_eq!(rest, "Name");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_zero_matches_without_required_is_absent() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("missing", "Nope");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item><Name>A</Name></Item>");
        assert_eq!(tree, json!({}));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_single_match_is_a_scalar_unless_multi() {
        let evaluator = evaluator_with(&[]);
        let xml = "<Item><Name>A</Name></Item>";

        let scalar = MappingSpec::new().field("name", "Name");
        let (tree, _) = evaluate(&evaluator, &scalar, xml);
        assert_eq!(tree, json!({"name": "A"}));

        let multi = MappingSpec::new().field("name", "multi:Name");
        let (tree, _) = evaluate(&evaluator, &multi, xml);
        assert_eq!(tree, json!({"name": ["A"]}));
    }

    #[test]
    fn test_two_or_more_matches_always_yield_a_sequence() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("name", "Name");
        let (tree, _) = evaluate(&evaluator, &spec, "<Item><Name>A</Name><Name>B</Name></Item>");
        assert_eq!(tree, json!({"name": ["A", "B"]}));
    }

    #[test]
    fn test_required_missing_value_reports_and_stays_absent() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("name", "required:Nope");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item/>");
        assert_eq!(tree, json!({}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, TemplateErrorKind::RequiredMissing);
        assert_eq!(errors[0].field, "name");
    }

    #[test]
    fn test_lookup_substitutes_and_falls_back_on_miss() {
        let evaluator = evaluator_with(&[("country", &[("US", "United States")])]);
        let spec = MappingSpec::new().field("country", "multi:lookup(country)Code");
        let (tree, errors) = evaluate(
            &evaluator,
            &spec,
            "<Item><Code>US</Code><Code>ZZ</Code></Item>",
        );

        assert_eq!(tree, json!({"country": ["United States", "ZZ"]}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, TemplateErrorKind::LookupMiss);
        assert!(errors[0].message.contains("ZZ"));
    }

    #[test]
    fn test_missing_lookup_table_behaves_as_empty() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("country", "lookup(country)Code");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item><Code>US</Code></Item>");

        assert_eq!(tree, json!({"country": "US"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, TemplateErrorKind::LookupMiss);
    }

    #[test]
    fn test_float_and_int_coercion() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new()
            .field("lat", "float://Item/@Latitude")
            .field("count", "int:Count");
        let (tree, errors) = evaluate(
            &evaluator,
            &spec,
            r#"<Item Latitude="48.85"><Count>3</Count></Item>"#,
        );

        assert_eq!(tree, json!({"lat": 48.85, "count": 3}));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_coercion_failure_keeps_the_raw_value() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("lat", "float:Name");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item><Name>north</Name></Item>");

        assert_eq!(tree, json!({"lat": "north"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, TemplateErrorKind::Coercion);
    }

    #[test]
    fn test_boolean_coercion_follows_emptiness() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new()
            .field("set", "boolean:Flag")
            .field("unset", "boolean:Empty");
        let (tree, _) = evaluate(
            &evaluator,
            &spec,
            "<Item><Flag>yes</Flag><Empty></Empty></Item>",
        );

        assert_eq!(tree, json!({"set": true, "unset": false}));
    }

    #[test]
    fn test_nested_specifications_produce_nested_objects() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("id", "@ItemID").nested(
            "pos",
            MappingSpec::new()
                .field("lat", "float://Item/@Latitude")
                .field("lon", "float://Item/@Longitude"),
        );
        let (tree, errors) = evaluate(
            &evaluator,
            &spec,
            r#"<Item ItemID="1" Latitude="48.85" Longitude="2.29"/>"#,
        );

        assert_eq!(
            tree,
            json!({"id": "1", "pos": {"lat": 48.85, "lon": 2.29}})
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn test_nested_errors_carry_the_dotted_field_path() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().nested(
            "pos",
            MappingSpec::new().field("lat", "required://Item/@Latitude"),
        );
        let (_, errors) = evaluate(&evaluator, &spec, "<Item/>");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "pos.lat");
    }

    #[test]
    fn test_computed_fields_bypass_query_and_modifiers() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new()
            .computed("kind", |_| json!("place"))
            .computed("id", |doc| json!(doc.identifier("@ItemID").ok().flatten()));
        let (tree, errors) = evaluate(&evaluator, &spec, r#"<Item ItemID="9"/>"#);

        assert_eq!(tree, json!({"kind": "place", "id": "9"}));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_query_error_reports_and_field_stays_absent() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new().field("bad", "a///b");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item/>");

        assert_eq!(tree, json!({}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, TemplateErrorKind::Query);
    }

    #[test]
    fn test_evaluation_continues_after_field_errors() {
        let evaluator = evaluator_with(&[]);
        let spec = MappingSpec::new()
            .field("bad", "required:Nope")
            .field("good", "Name");
        let (tree, errors) = evaluate(&evaluator, &spec, "<Item><Name>A</Name></Item>");

        assert_eq!(tree, json!({"good": "A"}));
        assert_eq!(errors.len(), 1);
    }
}
