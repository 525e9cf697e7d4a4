use localkb_core::config::EmbeddingConfig;
use localkb_core::traits::Embedder;
use localkb_embed::{get_default_embedder, HashEmbedder};

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[test]
fn hash_embedder_shapes_and_determinism() {
    // Force fake embedder to avoid loading a large model
    std::env::set_var("APP_USE_FAKE_EMBEDDINGS", "1");

    let embedder = get_default_embedder(&EmbeddingConfig { dimension: 256, ..Default::default() }).expect("embedder");
    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).expect("embed_batch");
    let v1 = &embs[0];
    let v2 = &embs[1];

    assert_eq!(v1.len(), 256);
    assert_eq!(embedder.dim(), 256);

    let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");

    for (a, b) in v1.iter().zip(v2.iter()) {
        assert!((a - b).abs() <= 1e-6);
    }
}

#[test]
fn lexical_overlap_raises_similarity() {
    let e = HashEmbedder::new(512);
    let q = e.embed_text("rust borrow checker");
    let near = e.embed_text("the borrow checker in Rust");
    let far = e.embed_text("baking sourdough bread at home");
    assert!(cosine(&q, &near) > cosine(&q, &far));
}

#[test]
fn empty_text_gives_zero_vector() {
    let e = HashEmbedder::new(8);
    assert!(e.embed_text("   ").iter().all(|x| *x == 0.0));
}
