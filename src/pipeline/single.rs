use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::docx::document::DocumentTree;
use crate::docx::text::paragraph_text;
use crate::engine::segments::token;
use crate::engine::{
    prune_empty, refresh_fields, remove_absent_zones, strip_markers, substitute, substitute_raw,
    substitute_segments, RawReplacements,
};
use crate::error::{SynthesisError, Warning};
use crate::metadata::{DocumentRecord, GenerationType, MetadataStore, UserIdentity};
use crate::record::{
    company_key, segment_key, sub_segment_key, FlatRecord, InputRecord, Scope, MAX_COMPANIES,
};
use crate::template::{self, TemplateStore};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\{\{(?:market_name|region|country|Company(?:10|[1-9])|Segment[1-6](?:Sub-[Ss]egment(?:10|[1-9])|_Start|_End)?)\}\}",
    )
    .expect("placeholder regex")
});

/// Output of one synthesis call.
#[derive(Clone, Debug)]
pub struct SynthesizedDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub warnings: Vec<Warning>,
    /// Metadata record id, when the store accepted the record.
    pub record_id: Option<String>,
}

/// Bytes and warnings of a rendered document, before it is recorded.
#[derive(Clone, Debug)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub warnings: Vec<Warning>,
}

/// Fills report templates from input records. Holds no per-call state, so
/// one instance serves concurrent calls.
#[derive(Clone)]
pub struct Synthesizer {
    templates: Arc<dyn TemplateStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl Synthesizer {
    pub fn new(templates: Arc<dyn TemplateStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            templates,
            metadata,
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    /// Validates the flat submission, then synthesizes it.
    pub fn synthesize_flat(
        &self,
        flat: &FlatRecord,
        user: &UserIdentity,
    ) -> Result<SynthesizedDocument, SynthesisError> {
        let record = InputRecord::from_flat(flat)?;
        self.synthesize(&record, user)
    }

    pub fn synthesize(
        &self,
        record: &InputRecord,
        user: &UserIdentity,
    ) -> Result<SynthesizedDocument, SynthesisError> {
        let rendered = self.render(record, user)?;
        let filename = record.file_name();
        let record_id =
            self.record_document(record, user, &filename, GenerationType::Single, None);
        Ok(SynthesizedDocument {
            filename,
            bytes: rendered.bytes,
            warnings: rendered.warnings,
            record_id,
        })
    }

    /// Runs every rewriting pass over a fresh copy of the record's template.
    pub fn render(&self, record: &InputRecord, user: &UserIdentity) -> Result<Rendered, SynthesisError> {
        let class = record.template_class();
        let asset = template::resolve(class, record.scope().region())?;
        info!(
            template = asset.id(),
            market = record.market_name(),
            scope = record.scope().label(),
            "generating document"
        );
        let template_bytes = self.templates.fetch(asset)?;
        let mut tree = DocumentTree::from_bytes(&template_bytes)
            .map_err(|e| SynthesisError::corrupt(asset.id(), format!("{e:#}")))?;
        log_placeholders(&tree);

        let internal = |source: anyhow::Error| SynthesisError::Internal {
            user: user.username.clone(),
            template_class: class.to_string(),
            source,
        };

        let mut warnings = Vec::new();
        match record.scope() {
            Scope::Regional(region) => {
                warnings.extend(substitute(&mut tree, "{{region}}", region.label()).warnings);
            }
            Scope::Country(country) => {
                warnings.extend(substitute(&mut tree, "{{country}}", country).warnings);
            }
            Scope::Global => {
                // Global templates have no scope token of their own.
                substitute(&mut tree, "{{region}}", "Global");
                substitute(&mut tree, "{{country}}", "Global");
            }
        }

        let market = record.market_name();
        warnings.extend(substitute(&mut tree, "{{market_name}}", market).warnings);
        // Textboxes and drawings get the same values before any pruning.
        let raw = substitute_raw(&mut tree, &raw_replacements(record));
        warnings.extend(raw.warnings);

        warnings.extend(substitute_segments(&mut tree, record.segments()));
        prune_empty(&mut tree);

        for i in 1..=MAX_COMPANIES {
            let name = record.companies().get(i - 1).map(String::as_str).unwrap_or("");
            let res = substitute(&mut tree, &format!("{{{{{}}}}}", company_key(i)), name);
            if !name.is_empty() {
                warnings.extend(res.warnings);
            }
        }

        remove_absent_zones(&mut tree, &record.present_segments())
            .map_err(|e| SynthesisError::corrupt(asset.id(), e))?;
        strip_markers(&mut tree);
        refresh_fields(&mut tree);

        let body_bytes = tree.to_bytes().context("serialize document").map_err(internal)?;

        let mut tree = DocumentTree::from_bytes(&body_bytes)
            .context("reload serialized document")
            .map_err(internal)?;
        let scope_text = record.scope().label();
        let aliased = substitute_raw(
            &mut tree,
            &RawReplacements::with_aliases(&[
                ("market_name", market),
                ("region", scope_text),
                ("country", scope_text),
            ]),
        );
        if !aliased.matched {
            debug!("no aliased textbox placeholders found");
        }
        warnings.extend(aliased.warnings);
        let bytes = tree.to_bytes().context("serialize headers").map_err(internal)?;

        info!(
            template = asset.id(),
            bytes = bytes.len(),
            warnings = warnings.len(),
            "document generated"
        );
        Ok(Rendered { bytes, warnings })
    }

    /// Stores the document record. A store failure is logged and yields `None`.
    pub(crate) fn record_document(
        &self,
        record: &InputRecord,
        user: &UserIdentity,
        filename: &str,
        generation_type: GenerationType,
        bulk_id: Option<&str>,
    ) -> Option<String> {
        let entry = DocumentRecord {
            user_id: user.id.clone(),
            input_data: record.to_flat(),
            filename: filename.to_string(),
            template_class: record.template_class(),
            generation_type,
            created_at: Utc::now(),
            status: "completed".to_string(),
            bulk_id: bulk_id.map(str::to_string),
        };
        match self.metadata.record_document(&entry) {
            Ok(id) => {
                debug!(id = %id, filename, "stored document metadata");
                Some(id)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), filename, "failed to store document metadata");
                None
            }
        }
    }
}

/// Exact record tokens for textbox and drawing text. Companies without a
/// name map to empty text; absent segments are left for pruning.
fn raw_replacements(record: &InputRecord) -> RawReplacements {
    let mut pairs = vec![("{{market_name}}".to_string(), record.market_name().to_string())];
    match record.scope() {
        Scope::Global => {
            pairs.push(("{{region}}".to_string(), "Global".to_string()));
            pairs.push(("{{country}}".to_string(), "Global".to_string()));
        }
        Scope::Regional(region) => pairs.push(("{{region}}".to_string(), region.label().to_string())),
        Scope::Country(country) => pairs.push(("{{country}}".to_string(), country.clone())),
    }
    for (i, seg) in record.segments().iter().enumerate() {
        if !seg.is_present() {
            continue;
        }
        pairs.push((token(&segment_key(i + 1)), seg.name.clone()));
        for (j, sub) in seg.sub_segments.iter().enumerate() {
            if !sub.is_empty() {
                pairs.push((token(&sub_segment_key(i + 1, j + 1)), sub.clone()));
            }
        }
    }
    for i in 1..=MAX_COMPANIES {
        let name = record.companies().get(i - 1).cloned().unwrap_or_default();
        pairs.push((token(&company_key(i)), name));
    }
    RawReplacements::literal(&pairs)
}

/// Closed-vocabulary tokens still present anywhere in the document.
pub fn find_placeholders(tree: &DocumentTree) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut collect = |_: &str, p: &crate::docx::tree::XmlElement| {
        for m in PLACEHOLDER_RE.find_iter(&paragraph_text(p)) {
            found.insert(m.as_str().to_string());
        }
    };
    tree.for_each_paragraph(&mut collect);
    tree.for_each_raw_paragraph(&mut collect);
    found
}

/// Debug dump of the template's paragraph and cell text.
pub fn log_placeholders(tree: &DocumentTree) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    tree.for_each_paragraph(&mut |part, p| {
        let text = paragraph_text(p);
        if !text.trim().is_empty() {
            debug!(part, text = %text, "template paragraph");
        }
    });
    let tokens = find_placeholders(tree);
    debug!(count = tokens.len(), tokens = ?tokens, "template placeholders");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{find_placeholders, Synthesizer};
    use crate::docx::document::DocumentTree;
    use crate::error::{SynthesisError, Warning};
    use crate::metadata::{MemoryStore, UserIdentity};
    use crate::record::{FlatRecord, Region, TemplateClass};
    use crate::template::{resolve, MemoryTemplateStore, TemplateAsset, TemplateStore};
    use crate::testutil::{para, part_text, part_xml, report_template, textbox, DocxBuilder};

    fn flat(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn templates() -> MemoryTemplateStore {
        let mut store = MemoryTemplateStore::new();
        let asset = |c, r| resolve(c, r).expect("asset");
        store.insert(asset(TemplateClass::Global, None), report_template("{{region}}"));
        store.insert(asset(TemplateClass::Country, None), report_template("{{country}}"));
        for r in Region::ALL {
            store.insert(asset(TemplateClass::Regional, Some(r)), report_template("{{region}}"));
        }
        store
    }

    fn synthesizer(meta: Arc<MemoryStore>) -> Synthesizer {
        Synthesizer::new(Arc::new(templates()), meta)
    }

    fn remaining(bytes: &[u8]) -> Vec<String> {
        let tree = DocumentTree::from_bytes(bytes).expect("reload");
        find_placeholders(&tree).into_iter().collect()
    }

    #[test]
    fn global_drones_report() {
        let meta = Arc::new(MemoryStore::new());
        let synth = synthesizer(meta.clone());
        let doc = synth
            .synthesize_flat(
                &flat(&[
                    ("market_name", "Drones"),
                    ("Segment1", "Consumer"),
                    ("Segment1Sub-segment1", "Hobby"),
                    ("Segment1Sub-segment2", "Racing"),
                    ("Company1", "Acme"),
                ]),
                &UserIdentity::default(),
            )
            .expect("synthesize");

        assert_eq!(doc.filename, "Global Drones Market.docx");
        let body = part_text(&doc.bytes, "word/document.xml");
        assert!(body.starts_with("Drones Market Report|Scope: Global|"), "{body}");
        assert!(body.contains("Segment 1: Consumer|Hobby|Racing"), "{body}");
        assert!(body.contains("Company: Acme"), "{body}");
        assert!(body.ends_with("Drones in Global|Consumer: Hobby|Top: Acme"), "{body}");
        assert!(!body.contains("Segment 2"), "{body}");
        assert!(!body.contains("{{"), "{body}");
        assert_eq!(part_text(&doc.bytes, "word/header1.xml"), "Drones Market|Global");
        assert_eq!(part_text(&doc.bytes, "word/footer1.xml"), "Confidential");
        assert!(part_xml(&doc.bytes, "word/document.xml").contains(r#"w:dirty="true""#));
        assert!(remaining(&doc.bytes).is_empty());

        let stored = meta.documents.lock().expect("lock");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].template_class, TemplateClass::Global);
        assert_eq!(stored[0].filename, doc.filename);
        assert!(doc.record_id.is_some());
    }

    #[test]
    fn absent_segments_lose_their_sections() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let doc = synth
            .synthesize_flat(
                &flat(&[
                    ("template_type", "Country"),
                    ("country", "India"),
                    ("market_name", "Drones"),
                    ("Segment1", "Consumer"),
                    ("Segment1Sub-segment1", "Hobby"),
                    ("Segment2", ""),
                    ("Segment3", "Military"),
                    ("Segment3Sub-segment1", "Swarms"),
                ]),
                &UserIdentity::default(),
            )
            .expect("synthesize");
        assert_eq!(doc.filename, "India Drones Market.docx");
        let body = part_text(&doc.bytes, "word/document.xml");
        assert!(body.contains("Scope: India"), "{body}");
        assert!(body.contains("Segment 1: Consumer"), "{body}");
        assert!(body.contains("Segment 3: Military"), "{body}");
        for gone in ["Segment 2", "Segment 4", "Segment 5", "Segment 6", "_Start", "_End"] {
            assert!(!body.contains(gone), "{gone} in {body}");
        }
        // Table keeps the header row and the rows of present segments.
        assert!(
            body.contains("Segment|Leading sub-segment|Consumer|Hobby|Military|Swarms"),
            "{body}"
        );
        assert_eq!(part_text(&doc.bytes, "word/header1.xml"), "Drones Market|India");
        assert!(remaining(&doc.bytes).is_empty());
    }

    #[test]
    fn body_textbox_tokens_are_resolved() {
        let mut store = MemoryTemplateStore::new();
        let body = [
            para("{{market_name}}"),
            textbox(&[para("{{region}} {{Segment2}} {{Company1}} {{market_name}}")]),
        ]
        .concat();
        store.insert(
            resolve(TemplateClass::Regional, Some(Region::Europe)).expect("asset"),
            DocxBuilder::new().body(&body).build(),
        );
        let synth = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()));
        let doc = synth
            .synthesize_flat(
                &flat(&[
                    ("template_type", "Regional"),
                    ("region", "Europe"),
                    ("market_name", "Drones"),
                    ("Segment1", "Consumer"),
                    ("Company1", "Acme"),
                ]),
                &UserIdentity::default(),
            )
            .expect("synthesize");
        assert_eq!(part_text(&doc.bytes, "word/document.xml"), "Drones|Europe  Acme Drones");
        assert!(remaining(&doc.bytes).is_empty());
    }

    #[test]
    fn single_paragraph_zone_of_absent_segment_is_removed() {
        let mut store = MemoryTemplateStore::new();
        let body = [para("keep"), para("{{Segment2_Start}} optional {{Segment2_End}}")].concat();
        store.insert(
            resolve(TemplateClass::Global, None).expect("asset"),
            DocxBuilder::new().body(&body).build(),
        );
        let synth = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()));
        let doc = synth
            .synthesize_flat(
                &flat(&[("market_name", "Drones"), ("Segment1", "Consumer")]),
                &UserIdentity::default(),
            )
            .expect("synthesize");
        assert_eq!(part_text(&doc.bytes, "word/document.xml"), "keep");
    }

    #[test]
    fn regional_report_uses_region_template_and_label() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let doc = synth
            .synthesize_flat(
                &flat(&[
                    ("template_type", "Regional"),
                    ("region", "Asia Pacific"),
                    ("market_name", "Drones"),
                ]),
                &UserIdentity::default(),
            )
            .expect("synthesize");
        assert_eq!(doc.filename, "Asia Pacific Drones Market.docx");
        assert!(part_text(&doc.bytes, "word/document.xml").contains("Scope: Asia Pacific"));
        assert_eq!(part_text(&doc.bytes, "word/header1.xml"), "Drones Market|Asia Pacific");
    }

    #[test]
    fn synthesis_is_idempotent() {
        let synth = synthesizer(Arc::new(MemoryStore::new()));
        let input = flat(&[("market_name", "Drones"), ("Segment1", "Consumer")]);
        let first = synth
            .synthesize_flat(&input, &UserIdentity::default())
            .expect("first");

        // Feed the output back in as a template.
        let mut store = MemoryTemplateStore::new();
        store.insert(resolve(TemplateClass::Global, None).expect("asset"), first.bytes.clone());
        let again = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()))
            .synthesize_flat(&input, &UserIdentity::default())
            .expect("second");
        assert_eq!(
            part_xml(&first.bytes, "word/document.xml"),
            part_xml(&again.bytes, "word/document.xml")
        );
        assert_eq!(
            part_text(&first.bytes, "word/header1.xml"),
            part_text(&again.bytes, "word/header1.xml")
        );
    }

    struct CountingStore {
        fetches: AtomicUsize,
    }

    impl TemplateStore for CountingStore {
        fn fetch(&self, asset: TemplateAsset) -> Result<Vec<u8>, SynthesisError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Err(SynthesisError::TemplateNotFound {
                asset: asset.id().to_string(),
                path: asset.id().into(),
            })
        }
    }

    #[test]
    fn regional_without_region_fails_before_loading() {
        let store = Arc::new(CountingStore {
            fetches: AtomicUsize::new(0),
        });
        let meta = Arc::new(MemoryStore::new());
        let synth = Synthesizer::new(store.clone(), meta.clone());
        let err = synth
            .synthesize_flat(
                &flat(&[("template_type", "Regional"), ("market_name", "Drones")]),
                &UserIdentity::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SynthesisError::MissingScopeField { field: "region", .. }));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
        assert!(meta.documents.lock().expect("lock").is_empty());
    }

    #[test]
    fn missing_template_is_reported() {
        let synth = Synthesizer::new(Arc::new(MemoryTemplateStore::new()), Arc::new(MemoryStore::new()));
        let err = synth
            .synthesize_flat(&flat(&[("market_name", "Drones")]), &UserIdentity::default())
            .unwrap_err();
        assert!(matches!(err, SynthesisError::TemplateNotFound { .. }));
    }

    #[test]
    fn unpaired_start_marker_is_corrupt() {
        let mut store = MemoryTemplateStore::new();
        let body = [para("{{market_name}}"), para("{{Segment3_Start}}")].concat();
        store.insert(
            resolve(TemplateClass::Global, None).expect("asset"),
            DocxBuilder::new().body(&body).build(),
        );
        let synth = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()));
        let err = synth
            .synthesize_flat(&flat(&[("market_name", "Drones")]), &UserIdentity::default())
            .unwrap_err();
        assert!(matches!(err, SynthesisError::TemplateCorrupt { .. }));
    }

    #[test]
    fn garbage_template_is_corrupt() {
        let mut store = MemoryTemplateStore::new();
        store.insert(resolve(TemplateClass::Global, None).expect("asset"), b"not a zip".to_vec());
        let synth = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()));
        let err = synth
            .synthesize_flat(&flat(&[("market_name", "Drones")]), &UserIdentity::default())
            .unwrap_err();
        assert_eq!(err.kind(), "TemplateCorrupt");
    }

    #[test]
    fn metadata_failure_does_not_fail_synthesis() {
        let synth = synthesizer(Arc::new(MemoryStore::failing()));
        let doc = synth
            .synthesize_flat(&flat(&[("market_name", "Drones")]), &UserIdentity::default())
            .expect("synthesize");
        assert!(doc.record_id.is_none());
        assert!(!doc.bytes.is_empty());
    }

    #[test]
    fn unresolved_tokens_are_warnings() {
        let mut store = MemoryTemplateStore::new();
        store.insert(
            resolve(TemplateClass::Global, None).expect("asset"),
            DocxBuilder::new().body(&para("no tokens")).build(),
        );
        let synth = Synthesizer::new(Arc::new(store), Arc::new(MemoryStore::new()));
        let doc = synth
            .synthesize_flat(&flat(&[("market_name", "Drones")]), &UserIdentity::default())
            .expect("synthesize");
        assert!(doc.warnings.contains(&Warning::PlaceholderUnresolved {
            token: "{{market_name}}".to_string()
        }));
    }
}
