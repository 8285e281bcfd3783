use amxml::dom::{new_document, NodePtr};

use crate::error::SlicerError;

/// A query-capable handle over one extracted fragment.
///
/// Parsing and XPath evaluation are delegated to the `amxml` XML
/// processor; this adapter owns only the glue: context selection,
/// attribute targets, text collection and identifier extraction. The
/// fragment text must be a standalone well-formed XML document; anything
/// else fails with [`SlicerError::MalformedFragment`], which can
/// legitimately happen when the delimiter pattern over- or
/// under-captures.
///
/// Relative expressions are evaluated with the fragment's root element as
/// the context node, so `@ItemID` resolves against `<Item ItemID="...">`;
/// absolute expressions (`/...`, `//...`) are evaluated from the document
/// node.
///
/// # Examples
///
/// ```
/// use xml_slicer::core::document::FragmentDocument;
///
/// let doc = FragmentDocument::parse(
///     r#"<Item ItemID="7"><Name>Alpha</Name><Name>Beta</Name></Item>"#,
/// ).unwrap();
///
/// assert_eq!(doc.query("@ItemID").unwrap(), vec!["7"]);
/// assert_eq!(doc.query("Name").unwrap(), vec!["Alpha", "Beta"]);
/// assert_eq!(doc.query("//Item/Name").unwrap(), vec!["Alpha", "Beta"]);
/// ```
pub struct FragmentDocument {
    doc: NodePtr,
    root: NodePtr,
}

impl FragmentDocument {
    /// Parses fragment text into a query-capable document.
    pub fn parse(text: &str) -> Result<Self, SlicerError> {
        let doc =
            new_document(text).map_err(|e| SlicerError::MalformedFragment(e.to_string()))?;
        let root = doc.root_element();
        Ok(Self { doc, root })
    }

    /// The fragment's root element, for callers (such as computed mapping
    /// fields) that want to navigate the document directly.
    pub fn root(&self) -> &NodePtr {
        &self.root
    }

    /// Evaluates a path expression and returns the text content of every
    /// matching node, in document order, trimmed.
    ///
    /// Expressions targeting an attribute (`@Name`, `path/@Name`) resolve
    /// the element path first and read the named attribute from each
    /// match; element matches yield the concatenation of their descendant
    /// text. An expression the engine rejects fails with
    /// [`SlicerError::InvalidExpression`].
    pub fn query(&self, expr: &str) -> Result<Vec<String>, SlicerError> {
        if let Some((path, attribute)) = attribute_target(expr) {
            let values: Vec<String> = match path {
                None => self.root.attribute_value(attribute).into_iter().collect(),
                // The document node has no attributes.
                Some("") => Vec::new(),
                Some(path) => self
                    .nodeset(path, expr)?
                    .iter()
                    .filter_map(|node| node.attribute_value(attribute))
                    .collect(),
            };
            return Ok(values.iter().map(|value| value.trim().to_string()).collect());
        }

        let nodes = self.nodeset(expr, expr)?;
        Ok(nodes
            .iter()
            .map(|node| node_text(node).trim().to_string())
            .collect())
    }

    /// Evaluates an identifier locator expression and returns the first
    /// matching node's text, if any. Absence of a match is not an error.
    pub fn identifier(&self, expr: &str) -> Result<Option<String>, SlicerError> {
        Ok(self.query(expr)?.into_iter().next())
    }

    fn nodeset(&self, path: &str, expression: &str) -> Result<Vec<NodePtr>, SlicerError> {
        let context = if path.starts_with('/') {
            &self.doc
        } else {
            &self.root
        };
        context
            .get_nodeset(path)
            .map_err(|e| SlicerError::InvalidExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}

/// Concatenation of a node's descendant text content, untrimmed.
fn node_text(node: &NodePtr) -> String {
    let mut text = String::new();
    node.each_node(".//text()", |t| text.push_str(&t.value()));
    text
}

/// Splits an expression that targets an attribute (`@Name` or
/// `path/@Name`) into its element path and attribute name. Expressions
/// where the trailing step is not a plain attribute name are left to the
/// XPath engine untouched.
fn attribute_target(expr: &str) -> Option<(Option<&str>, &str)> {
    if let Some(name) = expr.strip_prefix('@') {
        return is_attribute_name(name).then_some((None, name));
    }
    let (path, name) = expr.rsplit_once("/@")?;
    is_attribute_name(name).then_some((Some(path), name))
}

fn is_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}
