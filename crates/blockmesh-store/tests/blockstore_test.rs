//! Integration tests for blockmesh-store
//!
//! Exercise a store through its public surface the way routing layers do:
//! via accessors and the capability traits, across restarts.

use blockmesh_config::testing::TestEnvironment;
use blockmesh_store::{
    BlockSource, BlockStore, BlockStoreOptions, ScopedStore, StoreError, MAX_BLOCK_SIZE,
};
use futures::StreamExt;
use std::sync::Arc;

async fn open(env: &TestEnvironment, name: &str, capacity: u64) -> Arc<BlockStore> {
    let cfg = env.config_for(name, capacity);
    BlockStore::open_with_config(&cfg.storage).await.unwrap()
}

#[tokio::test]
async fn test_store_then_get_returns_identical_bytes() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env, "a", 1 << 20).await;
    let acc = store.accessor("usera").unwrap();

    let sizes = [0usize, 1, 31, 4096, MAX_BLOCK_SIZE - 1, MAX_BLOCK_SIZE];
    for (i, size) in sizes.iter().enumerate() {
        let key = format!("{:04x}", i);
        let block: Vec<u8> = (0..*size).map(|b| (b * 7 + i) as u8).collect();
        acc.store(&key, &block).await.unwrap();
        assert_eq!(acc.get(&key).await.unwrap(), block, "size {}", size);
    }

    let expected: u64 = sizes.iter().map(|s| *s as u64).sum();
    assert_eq!(acc.quota().await.unwrap(), expected);
}

#[tokio::test]
async fn test_quota_sums_and_tracks_removals() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env, "a", 1 << 20).await;
    let acc = store.accessor("usera").unwrap();

    let sizes = [10u64, 200, 3000];
    for (i, size) in sizes.iter().enumerate() {
        acc.store(&format!("{:02x}", i), &vec![0u8; *size as usize])
            .await
            .unwrap();
    }
    assert_eq!(acc.quota().await.unwrap(), 3210);

    acc.remove("01").await.unwrap();
    assert_eq!(acc.quota().await.unwrap(), 3010);
    assert!(matches!(
        acc.get("01").await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let env = TestEnvironment::new().unwrap();
    {
        let store = open(&env, "a", 1 << 20).await;
        let alice = store.accessor("alice").unwrap();
        let bob = store.accessor("bob").unwrap();
        alice.store("aa", &[1u8; 100]).await.unwrap();
        alice.store("bb", &[1u8; 50]).await.unwrap();
        bob.store("aa", &[2u8; 7]).await.unwrap();
    }

    let reopened = open(&env, "a", 1 << 20).await;
    let quota = reopened.quota();
    assert_eq!(quota["alice"], 150);
    assert_eq!(quota["bob"], 7);
    assert_eq!(
        reopened.accessor("bob").unwrap().get("aa").await.unwrap(),
        vec![2u8; 7]
    );
}

#[tokio::test]
async fn test_preexisting_files_are_counted_and_readable() {
    let env = TestEnvironment::new().unwrap();
    env.seed_file("seeded", "usera$0123", &[b'a'; 11]).unwrap();
    env.seed_file("seeded", "userb$0123", &[b'b'; 21]).unwrap();
    env.seed_file("seeded", "userc$0123", &[b'c'; 31]).unwrap();

    let store = open(&env, "seeded", 1 << 20).await;
    let quota = store.quota();
    assert_eq!(quota["usera"], 11);
    assert_eq!(quota["userb"], 21);
    assert_eq!(quota["userc"], 31);

    // Replace usera's block and put the old one back; quota follows each step
    let acc = store.accessor("usera").unwrap();
    let old = acc.get("0123").await.unwrap();
    let new = b"This is some new data";
    acc.store("0123", new).await.unwrap();
    assert_eq!(acc.quota().await.unwrap(), new.len() as u64);
    acc.store("0123", &old).await.unwrap();
    assert_eq!(acc.quota().await.unwrap(), old.len() as u64);
}

#[tokio::test]
async fn test_scan_visits_every_owned_block_once() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env, "a", 1 << 20).await;
    let acc = store.accessor("usera").unwrap();
    let other = store.accessor("userb").unwrap();

    for i in 0..150u32 {
        acc.store(&format!("{:08x}", i), b"x").await.unwrap();
    }
    other.store("ffff", b"y").await.unwrap();

    let mut keys: Vec<String> = acc.scan_once().map(|r| r.unwrap()).collect().await;
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 150);
    assert!(!keys.contains(&"ffff".to_string()));
}

#[tokio::test]
async fn test_accessors_work_as_trait_objects() {
    let env = TestEnvironment::new().unwrap();
    let store = open(&env, "a", 1 << 20).await;
    let scoped: Arc<dyn ScopedStore> = Arc::new(store.accessor("usera").unwrap());

    assert_eq!(scoped.store("0abc", b"via dyn").await.unwrap(), 7);
    assert_eq!(scoped.get("0abc").await.unwrap(), b"via dyn");
    assert_eq!(scoped.id(), store.id());
    assert_eq!(scoped.size().await.unwrap(), 1 << 20);

    // Arc<dyn ...> is itself a BlockSource
    let source: Arc<dyn ScopedStore> = Arc::clone(&scoped);
    BlockSource::remove(&source, "0abc").await.unwrap();
    assert_eq!(scoped.quota().await.unwrap(), 0);
}

#[tokio::test]
async fn test_direct_options_construction() {
    let env = TestEnvironment::new().unwrap();
    let store = BlockStore::open(
        env.store_root("direct"),
        BlockStoreOptions::default().with_capacity(10),
    )
    .await
    .unwrap();
    assert_eq!(store.size(), 10);
    let acc = store.accessor("usera").unwrap();
    assert!(matches!(
        acc.store("01", &[0u8; 11]).await,
        Err(StoreError::StoreFull { .. })
    ));
}
