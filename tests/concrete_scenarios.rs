//! End-to-end scenarios against the public API, each seeded against a fresh
//! temporary data directory.

use crushdb::storage::btree::{BTree, SortOrder};
use crushdb::storage::codec::{BsonType, BsonValue};
use crushdb::storage::db_crate::Context;
use crushdb::storage::document::PageOffsetReference;
use crushdb::storage::engine::StorageEngine;
use crushdb::storage::index::IndexManager;
use crushdb::storage::journal::Journal;
use crushdb::storage::pager::PageManager;
use crushdb::storage::Document;
use tempdir::TempDir;

fn fresh_context(dir: &TempDir) -> Context {
    let journal = Journal::open(dir.path().join("crushdb.journal")).unwrap();
    let page_manager = PageManager::open(
        dir.path().join("crushdb.db"),
        dir.path().join("meta.dat"),
        Default::default(),
    )
    .unwrap();
    let index_manager = IndexManager::new(dir.path().join("indexes"));
    let engine = StorageEngine::new(journal, page_manager, index_manager);
    Context::new(dir.path().join("crates"), engine)
}

fn vehicle(id: u64, make: &str) -> Document {
    Document::new(id, vec![("vehicleMake".to_string(), BsonValue::String(make.to_string()))])
}

#[test]
fn scenario_1_find_by_make_counts_matches() {
    let dir = TempDir::new("crushdb-scenario").unwrap();
    let mut ctx = fresh_context(&dir);
    ctx.create_crate("Vehicle").unwrap();
    ctx.create_index("Vehicle", BsonType::String, "make_index", "vehicleMake", false, 3, SortOrder::Asc)
        .unwrap();

    for (id, make) in [(1, "Subaru"), (2, "Subaru"), (3, "Tesla"), (4, "BMW")] {
        ctx.insert("Vehicle", vehicle(id, make)).unwrap();
    }

    let subarus = ctx
        .engine()
        .find("Vehicle", "make_index", BsonValue::String("Subaru".to_string()))
        .unwrap();
    assert_eq!(subarus.len(), 2);

    let bmws = ctx
        .engine()
        .find("Vehicle", "make_index", BsonValue::String("BMW".to_string()))
        .unwrap();
    assert_eq!(bmws.len(), 1);

    let teslas = ctx
        .engine()
        .find("Vehicle", "make_index", BsonValue::String("Tesla".to_string()))
        .unwrap();
    assert_eq!(teslas.len(), 1);
}

#[test]
fn scenario_2_find_by_id_returns_single_document() {
    let dir = TempDir::new("crushdb-scenario").unwrap();
    let mut ctx = fresh_context(&dir);
    ctx.create_crate("Vehicle").unwrap();
    ctx.create_index("Vehicle", BsonType::String, "make_index", "vehicleMake", false, 3, SortOrder::Asc)
        .unwrap();
    ctx.create_index("Vehicle", BsonType::Long, "id_index", "_id", true, 3, SortOrder::Asc)
        .unwrap();

    let mut doc = vehicle(1, "Subaru");
    doc.fields.push(("_id".to_string(), BsonValue::Long(1_234_567)));
    ctx.insert("Vehicle", doc).unwrap();
    ctx.insert("Vehicle", {
        let mut d = vehicle(2, "Tesla");
        d.fields.push(("_id".to_string(), BsonValue::Long(7_654_321)));
        d
    })
    .unwrap();

    let found = ctx
        .engine()
        .find("Vehicle", "id_index", BsonValue::Long(1_234_567))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].document_id, 1);
}

#[test]
fn scenario_3_range_find_over_makes() {
    let dir = TempDir::new("crushdb-scenario").unwrap();
    let mut ctx = fresh_context(&dir);
    ctx.create_crate("Vehicle").unwrap();
    ctx.create_index("Vehicle", BsonType::String, "make_index", "vehicleMake", false, 3, SortOrder::Asc)
        .unwrap();

    for (id, make) in [(1, "Subaru"), (2, "Subaru"), (3, "Tesla"), (4, "BMW")] {
        ctx.insert("Vehicle", vehicle(id, make)).unwrap();
    }

    let found = ctx
        .engine()
        .range_find(
            "Vehicle",
            "make_index",
            BsonValue::String("Acura".to_string()),
            BsonValue::String("Subaru".to_string()),
        )
        .unwrap();
    assert_eq!(found.len(), 3);
}

#[test]
fn scenario_4_delete_then_retrieve_is_not_found() {
    let dir = TempDir::new("crushdb-scenario").unwrap();
    let ctx = {
        let mut c = fresh_context(&dir);
        c.create_crate("Vehicle").unwrap();
        c
    };

    let first = ctx.engine().insert("Vehicle", vehicle(1, "Subaru")).unwrap();
    let second = ctx.engine().insert("Vehicle", vehicle(2, "Tesla")).unwrap();
    ctx.engine().delete("Vehicle", &first).unwrap();
    let third = ctx.engine().insert("Vehicle", vehicle(3, "BMW")).unwrap();

    let deleted_ref = first.page_offset_reference().unwrap();
    let err = ctx.engine().page_manager().retrieve_document(deleted_ref).unwrap_err();
    assert!(matches!(
        err,
        crushdb::storage::pager::PageManagerError::Page(crushdb::storage::page::PageError::DocumentNotFound(1))
    ));

    let second_ref = second.page_offset_reference().unwrap();
    let retrieved_second = ctx.engine().page_manager().retrieve_document(second_ref).unwrap();
    assert_eq!(retrieved_second.document_id, 2);

    let third_ref = third.page_offset_reference().unwrap();
    let retrieved_third = ctx.engine().page_manager().retrieve_document(third_ref).unwrap();
    assert_eq!(retrieved_third.document_id, 3);
}

#[test]
fn scenario_5_compact_then_split_page() {
    use crushdb::storage::page::Page;

    let mut page = Page::new(99, 4096);
    for i in 0..5u64 {
        let doc = Document::new(i, vec![("n".to_string(), BsonValue::Int(i as i32))]);
        page.insert_document(doc, false).unwrap();
    }
    page.delete_document(0).unwrap();
    page.delete_document(1).unwrap();
    assert!(page.compact());

    let new_page = page.split(100);
    assert_eq!(page.active_count(), 1);
    assert_eq!(new_page.active_count(), 2);
    assert_eq!(new_page.prev, Some(99));
    assert_eq!(page.next, Some(new_page.page_id));
}

#[test]
fn scenario_6_btree_order_three_sequential_insert() {
    let mut tree = BTree::new(3, false, SortOrder::Asc);
    for i in 1..=10i32 {
        tree.insert(
            crushdb::storage::codec::IndexKey::Int(i),
            PageOffsetReference::new(i as u64, i as u32),
        )
        .unwrap();
    }

    let found = tree.search(&crushdb::storage::codec::IndexKey::Int(7));
    assert_eq!(found, vec![PageOffsetReference::new(7, 7)]);

    let ranged = tree.range_search(
        &crushdb::storage::codec::IndexKey::Int(3),
        &crushdb::storage::codec::IndexKey::Int(8),
    );
    assert_eq!(
        ranged,
        (3..=8)
            .map(|i| PageOffsetReference::new(i as u64, i as u32))
            .collect::<Vec<_>>()
    );
}
