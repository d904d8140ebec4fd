use std::{fs, path::PathBuf, sync::Arc};

use common::Chunk;
use search_core::{Bm25Retriever, IndexStore, TfIdfRetriever};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RelevanceFixture {
    corpus: Vec<Chunk>,
    cases: Vec<RelevanceCase>,
}

#[derive(Debug, Deserialize)]
struct RelevanceCase {
    query: String,
    expected: String,
}

fn load_fixture() -> RelevanceFixture {
    let fixture_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("relevance.json");
    let raw = fs::read_to_string(fixture_path).expect("fixture");
    serde_json::from_str(&raw).expect("parse fixture")
}

#[tokio::test]
async fn sparse_relevance_harness_matches_fixture_expectations() {
    let fixture = load_fixture();
    let store = Arc::new(IndexStore::new());
    store.build(fixture.corpus).await.expect("build");

    let bm25 = Bm25Retriever::new(Arc::clone(&store));
    let tfidf = TfIdfRetriever::new(Arc::clone(&store));
    for case in &fixture.cases {
        let bm25_top = bm25.search(&case.query, 1).expect("bm25");
        assert_eq!(bm25_top.chunk_ids(), vec![case.expected.as_str()], "bm25: {}", case.query);
        let tfidf_top = tfidf.search(&case.query, 1).expect("tfidf");
        assert_eq!(tfidf_top.chunk_ids(), vec![case.expected.as_str()], "tfidf: {}", case.query);
    }
}

#[tokio::test]
async fn resolved_hits_carry_source_and_text() {
    let fixture = load_fixture();
    let store = Arc::new(IndexStore::new());
    store.build(fixture.corpus).await.expect("build");

    let result = Bm25Retriever::new(Arc::clone(&store))
        .search("kubernetes jobs", 1)
        .expect("search");
    let resolved = store.resolve(&result).expect("resolve");
    assert_eq!(resolved[0].source, "guides/launch.md");
    assert!(resolved[0].text.starts_with("Launch queues"));
    assert_eq!(resolved[0].rank, 1);
}
