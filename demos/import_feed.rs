//! Imports an XML feed file and prints one JSON document per item.
//!
//! Usage: `cargo run --example import_feed -- path/to/feed.xml`

use anyhow::{bail, Result};
use serde_json::{json, Value};
use xml_slicer::{
    FragmentDocument, ItemDecision, ItemFragment, MappingSpec, SlicerError, SlicerListener,
    TemplateError, XmlSlicerBuilder,
};

#[derive(Default)]
struct PrintItems {
    imported: usize,
    failed: usize,
}

impl SlicerListener for PrintItems {
    fn on_item(
        &mut self,
        _fragment: &ItemFragment,
        _doc: &FragmentDocument,
        mut decision: ItemDecision,
    ) -> ItemDecision {
        decision.include = true;
        decision
    }

    fn on_evaluated(&mut self, index: usize, tree: &Value) {
        self.imported += 1;
        println!("item {}: {}", index, tree);
    }

    fn on_template_error(&mut self, index: usize, error: &TemplateError) {
        eprintln!("item {}: {}", index, error);
    }

    fn on_parse_error(&mut self, index: usize, error: &SlicerError) {
        self.failed += 1;
        eprintln!("item {} skipped: {}", index, error);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: import_feed <feed.xml>");
    };

    let mapping = MappingSpec::new()
        .field("id", "@ItemID")
        .field("name", "required://Item/@Name")
        .field("description", "//Item/Description")
        .nested(
            "pos",
            MappingSpec::new()
                .field("lat", "float://Item/@Latitude")
                .field("lon", "float://Item/@Longitude"),
        )
        .computed("has_description", |doc| {
            json!(doc.identifier("//Item/Description").ok().flatten().is_some())
        });

    let mut slicer = XmlSlicerBuilder::new()
        .pattern(r"<Item(.|\n|\r)*?</Item>")
        .identifier("@ItemID")
        .mapping(mapping)
        .build()?;

    let mut listener = PrintItems::default();
    slicer.import_file(&path, &mut listener)?;

    println!(
        "{} item(s) imported, {} skipped, {} byte(s) unmatched",
        listener.imported,
        listener.failed,
        slicer.residual().len()
    );

    Ok(())
}
