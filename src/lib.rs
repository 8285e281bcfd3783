/*!
 # xml-slicer

 A toolkit for pulling discrete records ("items") out of large, loosely
 structured XML feeds. Instead of parsing the whole document, the slicer
 finds item boundaries with a delimiter pattern, so it copes with streams
 that are huge, truncated, or not well-formed as a whole; only each
 extracted fragment has to parse. Every fragment is then mapped to a
 nested JSON value through a declarative field-mapping template.

 ## Core Concepts

 - **FragmentExtractor:** consumes arbitrary-sized text chunks, keeps the
   unmatched remainder, and yields complete item fragments as they become
   matchable, no matter where the chunk boundaries fall.
 - **FragmentDocument:** wraps one fragment in a query-capable document
   handle and resolves path expressions such as `//Item/@Latitude`.
 - **MappingSpec / TemplateEvaluator:** a declarative tree mapping query
   expressions to output fields, with per-field modifiers for type
   coercion (`float`, `int`, `boolean`), multiplicity (`multi`), lookup
   substitution (`lookup(name)`) and validation (`required`).
 - **XmlSlicer:** drives the pipeline per fragment, raises lifecycle
   notifications through a [`SlicerListener`], and optionally persists
   raw fragments and evaluated output to disk.

 Content-level problems never abort the stream: malformed fragments,
 unknown modifiers, lookup misses and missing required values are all
 reported through the listener and processing continues.

 ## Getting Started

```rust
use serde_json::Value;
use xml_slicer::{
    FragmentDocument, ItemDecision, ItemFragment, MappingSpec, SlicerError, SlicerListener,
    XmlSlicerBuilder,
};

#[derive(Default)]
struct Importer {
    places: Vec<Value>,
}

impl SlicerListener for Importer {
    fn on_item(
        &mut self,
        _fragment: &ItemFragment,
        _doc: &FragmentDocument,
        mut decision: ItemDecision,
    ) -> ItemDecision {
        decision.include = true;
        decision
    }

    fn on_evaluated(&mut self, _index: usize, tree: &Value) {
        self.places.push(tree.clone());
    }
}

fn main() -> Result<(), SlicerError> {
    let mapping = MappingSpec::new()
        .field("name", "required://Item/@Name")
        .field("description", "//Item/Description")
        .nested(
            "pos",
            MappingSpec::new()
                .field("lat", "float://Item/@Latitude")
                .field("lon", "float://Item/@Longitude"),
        );

    let mut slicer = XmlSlicerBuilder::new()
        .pattern(r"<Item(.|\n|\r)*?</Item>")
        .identifier("@ItemID")
        .mapping(mapping)
        .build()?;

    let mut importer = Importer::default();

    // Chunks may split an item anywhere; the slicer reassembles it.
    slicer.feed(r#"<feed><Item ItemID="1" Name="Tower" "#, &mut importer)?;
    slicer.feed(r#"Latitude="48.858" Longitude="2.294">"#, &mut importer)?;
    slicer.feed("<Description>Iron lattice</Description></Item>", &mut importer)?;
    slicer.finish(&mut importer)?;

    assert_eq!(importer.places.len(), 1);
    assert_eq!(importer.places[0]["name"], "Tower");
    assert_eq!(importer.places[0]["pos"]["lat"], 48.858);

    Ok(())
}
```
*/

/// Core module for stream slicing and template evaluation
pub mod core;

/// Error types for slicing operations
pub mod error;

#[doc(inline)]
pub use error::*;

pub use crate::core::document::FragmentDocument;
pub use crate::core::extractor::{FragmentExtractor, ItemFragment};
pub use crate::core::slicer::{ItemDecision, SlicerListener, XmlSlicer, XmlSlicerBuilder};
pub use crate::core::template::{
    FieldModifiers, LookupCatalog, LookupTable, MappingField, MappingSpec, ModifierRegistry,
    TemplateError, TemplateErrorKind, TemplateEvaluator,
};
