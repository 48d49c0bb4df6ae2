#[path = "../src/test_support.rs"]
mod test_support;

use provmerge::{LoadType, PriorityConfig, RecordId, RecordStore, Value};
use test_support::{gene, reconciler_with};

#[test]
fn higher_priority_source_overrides_earlier_delivery() {
    // RefSeq has priority 1, GenBank priority 2
    let mut reconciler = reconciler_with(PriorityConfig::new().with_default(&["RefSeq", "GenBank"]));
    let genbank = reconciler.main_source("GenBank").unwrap();
    let genbank_skeleton = reconciler.skeleton_source("GenBank").unwrap();
    let refseq = reconciler.main_source("RefSeq").unwrap();
    let refseq_skeleton = reconciler.skeleton_source("RefSeq").unwrap();

    reconciler.begin_transaction().unwrap();
    let r1 = gene("eve", "abc").with_id(RecordId(1001));
    let first = reconciler
        .store_record(&r1, &genbank, &genbank_skeleton, LoadType::Source)
        .unwrap()
        .record;
    reconciler.commit_transaction().unwrap();
    let first_id = first.id.unwrap();
    assert_eq!(reconciler.provenance(first_id, "name").unwrap(), Some(genbank));

    reconciler.begin_transaction().unwrap();
    let r2 = gene("eve", "xyz").with_id(RecordId(1002));
    let outcome = reconciler
        .store_record(&r2, &refseq, &refseq_skeleton, LoadType::Source)
        .unwrap();
    reconciler.commit_transaction().unwrap();

    let survivor = outcome.record.id.unwrap();
    assert_eq!(outcome.record.scalar("name"), Some(&Value::text("xyz")));
    assert_eq!(reconciler.provenance(survivor, "name").unwrap(), Some(refseq));

    // one record remains and both delivered identities resolve to it
    assert_eq!(reconciler.primary().len(), 1);
    assert_eq!(reconciler.remap().resolve(RecordId(1001)), survivor);
    assert_eq!(reconciler.remap().resolve(RecordId(1002)), survivor);
    assert_eq!(
        reconciler
            .primary()
            .get(survivor)
            .unwrap()
            .unwrap()
            .scalar("name"),
        Some(&Value::text("xyz"))
    );
}

#[test]
fn lower_priority_delivery_only_fills_gaps() {
    let mut reconciler = reconciler_with(PriorityConfig::new().with_default(&["RefSeq", "GenBank"]));
    let genbank = reconciler.main_source("GenBank").unwrap();
    let genbank_skeleton = reconciler.skeleton_source("GenBank").unwrap();
    let refseq = reconciler.main_source("RefSeq").unwrap();
    let refseq_skeleton = reconciler.skeleton_source("RefSeq").unwrap();

    reconciler
        .store_record(&gene("eve", "xyz"), &refseq, &refseq_skeleton, LoadType::Source)
        .unwrap();
    let late = gene("eve", "abc").with_collection("publications", [Value::text("PMID:2885311")]);
    let merged = reconciler
        .store_record(&late, &genbank, &genbank_skeleton, LoadType::Source)
        .unwrap()
        .record;

    assert_eq!(merged.scalar("name"), Some(&Value::text("xyz")));
    assert_eq!(merged.collection("publications").map(|p| p.len()), Some(1));
    let id = merged.id.unwrap();
    assert_eq!(reconciler.provenance(id, "name").unwrap(), Some(refseq));
    assert_eq!(reconciler.provenance(id, "publications").unwrap(), Some(genbank));
}
