use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lancedb::Connection;
use localkb_core::error::{IngestionError, StoreError};
use localkb_core::types::{chunk_id, content_hash, Chunk, Meta};
use localkb_vector::index_file::{self, CollectionIndex};
use localkb_vector::schema::{CHUNKS_TABLE, VECTORS_TABLE};
use localkb_vector::{table, VectorStore};

fn chunk(source: &str, start: usize, text: &str) -> Chunk {
    Chunk {
        chunk_id: chunk_id(source, start),
        source_id: source.to_string(),
        text: text.to_string(),
        start_offset: start,
        end_offset: start + text.chars().count(),
        content_hash: content_hash(source),
        added_at: Utc::now(),
        metadata: Meta::new(),
    }
}

fn axis(dim: usize, hot: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[hot % dim] = 1.0;
    v
}

fn committed_index(collection_dir: &Path) -> anyhow::Result<CollectionIndex> {
    index_file::read(collection_dir)?.ok_or_else(|| anyhow::anyhow!("no index.json"))
}

/// Opens the tables the collection's index currently points at.
async fn current_tables(collection_dir: &Path) -> anyhow::Result<(CollectionIndex, Connection)> {
    let index = committed_index(collection_dir)?;
    let conn = table::open_db(&collection_dir.join(&index.data_dir)).await?;
    Ok((index, conn))
}

fn texts(store_guard: &localkb_vector::CollectionState) -> Vec<String> {
    store_guard.scan().map(|(c, _)| c.text.clone()).collect()
}

#[tokio::test]
async fn wrong_dimension_is_rejected_per_chunk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store.upsert("kb", vec![chunk("a", 0, "first")], vec![axis(768, 0)]).await?;

    let report = store
        .upsert(
            "kb",
            vec![chunk("b", 0, "ok one"), chunk("b", 10, "too short"), chunk("b", 20, "ok two")],
            vec![axis(768, 1), axis(384, 2), axis(768, 3)],
        )
        .await?;
    assert_eq!(report.inserted, 2);
    assert_eq!(
        report.rejected,
        vec![IngestionError::DimensionMismatch { chunk_id: "b#10".into(), expected: 768, actual: 384 }]
    );

    let guard = store.read("kb").await?.expect("exists");
    assert_eq!(texts(&guard), vec!["first", "ok one", "ok two"]);
    assert_eq!(guard.dimension(), Some(768));
    Ok(())
}

#[tokio::test]
async fn non_finite_vectors_are_rejected() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    let report = store
        .upsert("kb", vec![chunk("a", 0, "nan"), chunk("a", 5, "fine")], vec![vec![f32::NAN, 1.0], vec![0.0, 1.0]])
        .await?;
    assert_eq!(report.inserted, 1);
    assert!(matches!(report.rejected[0], IngestionError::InvalidEmbedding { .. }));
    Ok(())
}

#[tokio::test]
async fn contents_survive_reopen_in_insertion_order() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    {
        let store = VectorStore::open(tmp.path()).await?;
        let chunks: Vec<Chunk> = (0..5).map(|i| chunk(&format!("s{}", i % 2), i * 10, &format!("t{i}"))).collect();
        let vectors = (0..5).map(|i| axis(4, i)).collect();
        store.upsert("notes", chunks, vectors).await?;
        // overwriting an id moves it to the end
        store.upsert("notes", vec![chunk("s0", 0, "t0 again")], vec![axis(4, 3)]).await?;
        store.close().await;
    }

    let store = VectorStore::open(tmp.path()).await?;
    let stats = store.stats("notes").await?;
    assert_eq!(stats.chunk_count, 5);
    assert_eq!(stats.document_count, 2);
    assert_eq!(stats.dimension, Some(4));
    let guard = store.read("notes").await?.expect("exists");
    assert_eq!(texts(&guard), vec!["t1", "t2", "t3", "t4", "t0 again"]);
    let (_, v) = guard.get("s0#0").expect("overwritten chunk");
    assert_eq!(v, axis(4, 3).as_slice());
    Ok(())
}

#[tokio::test]
async fn delete_by_source_is_idempotent() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store
        .upsert(
            "kb",
            vec![chunk("a", 0, "a0"), chunk("b", 0, "b0"), chunk("a", 5, "a5")],
            vec![axis(3, 0), axis(3, 1), axis(3, 2)],
        )
        .await?;

    assert_eq!(store.delete_by_source("kb", "a").await?, 2);
    assert_eq!(store.delete_by_source("kb", "a").await?, 0);
    assert_eq!(store.delete_by_source("missing-collection", "a").await?, 0);

    let guard = store.read("kb").await?.expect("exists");
    assert_eq!(texts(&guard), vec!["b0"]);
    assert_eq!(guard.source_hash("a"), None);
    Ok(())
}

#[tokio::test]
async fn replace_source_swaps_chunks_unless_all_rejected() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store
        .upsert("kb", vec![chunk("doc", 0, "old0"), chunk("doc", 8, "old8"), chunk("other", 0, "keep")], vec![axis(4, 0), axis(4, 1), axis(4, 2)])
        .await?;

    let report = store.replace_source("kb", "doc", vec![chunk("doc", 0, "new0")], vec![axis(4, 3)]).await?;
    assert_eq!((report.inserted, report.removed), (1, 2));
    {
        let guard = store.read("kb").await?.expect("exists");
        assert_eq!(texts(&guard), vec!["keep", "new0"]);
    }

    let report = store.replace_source("kb", "doc", vec![chunk("doc", 0, "bad")], vec![axis(7, 0)]).await?;
    assert_eq!(report.inserted, 0);
    assert_eq!(report.rejected.len(), 1);
    let guard = store.read("kb").await?.expect("exists");
    assert_eq!(texts(&guard), vec!["keep", "new0"]);
    Ok(())
}

#[tokio::test]
async fn emptied_collection_accepts_a_new_dimension() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store.upsert("kb", vec![chunk("a", 0, "x"), chunk("b", 0, "y")], vec![axis(8, 0), axis(8, 1)]).await?;

    assert_eq!(store.clear("kb").await?, 2);
    assert_eq!(store.stats("kb").await?.dimension, None);
    store.upsert("kb", vec![chunk("c", 0, "z")], vec![axis(2, 0)]).await?;
    assert_eq!(store.stats("kb").await?.dimension, Some(2));

    store.delete_by_source("kb", "c").await?;
    store.upsert("kb", vec![chunk("d", 0, "w")], vec![axis(5, 0)]).await?;
    store.close().await;

    let reopened = VectorStore::open(tmp.path()).await?;
    let stats = reopened.stats("kb").await?;
    assert_eq!((stats.chunk_count, stats.dimension), (1, Some(5)));
    Ok(())
}

#[tokio::test]
async fn clear_creates_missing_collection() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    assert_eq!(store.clear("fresh").await?, 0);
    assert_eq!(store.list().await?, vec!["fresh"]);
    Ok(())
}

#[tokio::test]
async fn collections_are_isolated() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store.upsert("one", vec![chunk("shared", 0, "in one")], vec![axis(3, 0)]).await?;
    store.upsert("two", vec![chunk("shared", 0, "in two")], vec![axis(6, 0)]).await?;

    store.delete_by_source("one", "shared").await?;
    assert_eq!(store.stats("one").await?.chunk_count, 0);
    let two = store.stats("two").await?;
    assert_eq!((two.chunk_count, two.dimension), (1, Some(6)));
    assert_eq!(store.list().await?, vec!["one", "two"]);
    Ok(())
}

#[tokio::test]
async fn drop_removes_collection_from_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    store.upsert("gone", vec![chunk("a", 0, "x")], vec![axis(2, 0)]).await?;

    assert!(store.drop_collection("gone").await?);
    assert!(!tmp.path().join("gone").exists());
    assert!(store.get("gone").await?.is_none());
    assert!(matches!(store.stats("gone").await, Err(StoreError::NotFound(_))));
    assert!(!store.drop_collection("gone").await?);
    assert!(store.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn bad_names_are_refused() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = VectorStore::open(tmp.path()).await?;
    for name in ["", "../escape", ".hidden", "a/b", "spaces here"] {
        assert!(matches!(store.create_or_get(name).await, Err(StoreError::InvalidName(_))), "{name:?}");
    }
    Ok(())
}

#[tokio::test]
async fn unreadable_index_is_corruption_on_every_access() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("kb", vec![chunk("a", 0, "x")], vec![axis(2, 0)]).await?;
    }
    std::fs::write(tmp.path().join("kb").join("index.json"), "{ truncated")?;

    let store = VectorStore::open(tmp.path()).await?;
    assert!(matches!(store.stats("kb").await, Err(StoreError::Corruption { .. })));
    assert!(matches!(store.read("kb").await, Err(StoreError::Corruption { .. })));
    assert!(matches!(
        store.upsert("kb", vec![chunk("b", 0, "y")], vec![axis(2, 1)]).await,
        Err(StoreError::Corruption { .. })
    ));
    assert!(store.drop_collection("kb").await?);
    Ok(())
}

#[tokio::test]
async fn chunk_without_vector_is_corruption() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("kb", vec![chunk("a", 0, "x"), chunk("a", 4, "y")], vec![axis(2, 0), axis(2, 1)]).await?;
    }
    let (_, conn) = current_tables(&tmp.path().join("kb")).await?;
    let rows = table::read_chunks(&conn).await?;
    let seq = rows.iter().find(|(_, c)| c.chunk_id == "a#4").map(|(seq, _)| *seq).expect("stored row");
    table::delete_seqs(&conn, VECTORS_TABLE, &[seq]).await?;

    let store = VectorStore::open(tmp.path()).await?;
    match store.stats("kb").await {
        Err(StoreError::Corruption { detail, .. }) => assert!(detail.contains("a#4"), "{detail}"),
        other => panic!("expected corruption, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_writers_do_not_lose_chunks() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(VectorStore::open(tmp.path()).await?);
    let mut tasks = Vec::new();
    for i in 0..8usize {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let source = format!("src{i}");
            store
                .upsert("kb", vec![chunk(&source, 0, "a"), chunk(&source, 1, "b")], vec![axis(4, i), axis(4, i + 1)])
                .await
        }));
    }
    for t in tasks {
        t.await??;
    }
    let stats = store.stats("kb").await?;
    assert_eq!((stats.chunk_count, stats.document_count), (16, 8));
    Ok(())
}

#[tokio::test]
async fn missing_tables_are_corruption_not_an_empty_collection() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let kb_dir = tmp.path().join("kb");
    {
        let store = VectorStore::open(tmp.path()).await?;
        let chunks = (0..3).map(|i| chunk(&format!("doc{i}"), 0, "words")).collect();
        store.upsert("kb", chunks, (0..3).map(|i| axis(4, i)).collect()).await?;
        store.close().await;
    }
    let index = committed_index(&kb_dir)?;
    assert_eq!(index.chunk_count, 3);
    std::fs::remove_dir_all(kb_dir.join(&index.data_dir))?;

    let store = VectorStore::open(tmp.path()).await?;
    assert!(matches!(store.stats("kb").await, Err(StoreError::Corruption { .. })));
    assert!(matches!(store.read("kb").await, Err(StoreError::Corruption { .. })));
    assert_eq!(committed_index(&kb_dir)?.chunk_count, 3, "index must not be rewritten to match");
    Ok(())
}

#[tokio::test]
async fn lost_chunk_rows_are_corruption() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("kb", vec![chunk("a", 0, "x"), chunk("b", 0, "y")], vec![axis(2, 0), axis(2, 1)]).await?;
        store.close().await;
    }
    let (_, conn) = current_tables(&tmp.path().join("kb")).await?;
    let rows = table::read_chunks(&conn).await?;
    let seqs: Vec<u64> = rows.iter().filter(|(_, c)| c.source_id == "b").map(|(seq, _)| *seq).collect();
    table::delete_seqs(&conn, CHUNKS_TABLE, &seqs).await?;

    let store = VectorStore::open(tmp.path()).await?;
    match store.stats("kb").await {
        Err(StoreError::Corruption { detail, .. }) => assert!(detail.contains("'b'"), "{detail}"),
        other => panic!("expected corruption, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn rows_of_an_unfinished_write_are_discarded_on_load() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let kb_dir = tmp.path().join("kb");
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("kb", vec![chunk("a", 0, "committed"), chunk("a", 9, "also")], vec![axis(3, 0), axis(3, 1)]).await?;
        store.close().await;
    }

    // rows appended by a write that crashed before its index commit, plus a vector
    // whose chunk row was never written
    let (index, conn) = current_tables(&kb_dir).await?;
    let next = index.next_seq;
    let pending = [chunk("a", 0, "uncommitted rewrite"), chunk("ghost", 0, "never committed")];
    let chunk_rows: Vec<(u64, &Chunk)> = pending.iter().enumerate().map(|(i, c)| (next + i as u64, c)).collect();
    let v0 = axis(3, 2);
    let vector_rows: Vec<(u64, &str, &[f32])> = vec![
        (next, "a#0", v0.as_slice()),
        (next + 1, "ghost#0", v0.as_slice()),
        (next + 2, "orphan#0", v0.as_slice()),
    ];
    table::append_batch(&conn, VECTORS_TABLE, table::vectors_to_batch(&vector_rows, 3)?).await?;
    table::append_batch(&conn, CHUNKS_TABLE, table::chunks_to_batch(&chunk_rows)?).await?;

    let store = VectorStore::open(tmp.path()).await?;
    {
        let guard = store.read("kb").await?.expect("exists");
        assert_eq!(texts(&guard), vec!["committed", "also"]);
        assert_eq!(guard.stats().sources.into_iter().collect::<Vec<_>>(), vec!["a"]);
        let (_, v) = guard.get("a#0").expect("committed chunk");
        assert_eq!(v, axis(3, 0).as_slice());
    }
    assert_eq!(table::read_chunks(&conn).await?.len(), 2);
    assert_eq!(table::read_vectors(&conn).await?.1.len(), 2);

    // the next write reuses the sequence numbers without colliding
    store.upsert("kb", vec![chunk("b", 0, "later")], vec![axis(3, 2)]).await?;
    store.close().await;
    let reopened = VectorStore::open(tmp.path()).await?;
    assert_eq!(reopened.stats("kb").await?.chunk_count, 3);
    Ok(())
}

#[tokio::test]
async fn leftovers_of_interrupted_clears_and_drops_are_swept() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let kb_dir = tmp.path().join("kb");
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("kb", vec![chunk("a", 0, "x")], vec![axis(2, 0)]).await?;
        store.close().await;
    }
    let dropped = tmp.path().join(".trash-old-1");
    let old_data = kb_dir.join(".trash-data-1");
    let uncommitted = kb_dir.join("data-1");
    for dir in [&dropped, &old_data, &uncommitted] {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("leftover"), "x")?;
    }

    let store = VectorStore::open(tmp.path()).await?;
    assert!(!dropped.exists());
    assert_eq!(store.stats("kb").await?.chunk_count, 1);
    assert!(!old_data.exists());
    assert!(!uncommitted.exists());
    assert!(kb_dir.join(committed_index(&kb_dir)?.data_dir).is_dir());
    assert_eq!(store.list().await?, vec!["kb"]);
    Ok(())
}

#[tokio::test]
async fn a_writer_blocks_only_its_own_collection() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    {
        let store = VectorStore::open(tmp.path()).await?;
        store.upsert("busy", vec![chunk("a", 0, "x")], vec![axis(2, 0)]).await?;
        store.upsert("idle", vec![chunk("b", 0, "y")], vec![axis(2, 1)]).await?;
        store.close().await;
    }

    let store = VectorStore::open(tmp.path()).await?;
    let busy = store.create_or_get("busy").await?;
    let writer = busy.write_owned().await;

    // "idle" is not loaded yet; loading it must not wait on the writer
    let stats = tokio::time::timeout(Duration::from_secs(5), store.stats("idle")).await??;
    assert_eq!(stats.chunk_count, 1);
    assert!(tokio::time::timeout(Duration::from_millis(100), store.read("busy")).await.is_err());

    drop(writer);
    let guard = tokio::time::timeout(Duration::from_secs(5), store.read("busy")).await??;
    assert_eq!(guard.map(|g| g.len()), Some(1));
    Ok(())
}
