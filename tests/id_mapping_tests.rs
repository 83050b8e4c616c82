mod test_utils;

use pipes::repositories::{IdMapping, IdMappingRepository};
use test_utils::{mapping_of, setup_test_db};

#[tokio::test]
async fn missing_mapping_loads_empty() {
    let db = setup_test_db().await.unwrap();
    let repo = IdMappingRepository::new(db);

    let mapping = repo.load(5, "asana:projects").await.unwrap();
    assert!(mapping.is_empty());
    assert_eq!(mapping.key, "asana:projects");
    assert!(repo.load_reversed(5, "asana:projects").await.unwrap().is_empty());
}

#[tokio::test]
async fn saved_mapping_loads_back_equal() {
    let db = setup_test_db().await.unwrap();
    let repo = IdMappingRepository::new(db);

    let mut mapping = IdMapping::new(5, "asana:projects");
    mapping.insert("p-1", 11);
    mapping.insert("p-2", 12);
    repo.save(&mapping).await.unwrap();

    assert_eq!(repo.load(5, "asana:projects").await.unwrap(), mapping);

    let reversed = repo.load_reversed(5, "asana:projects").await.unwrap();
    assert_eq!(reversed.get(12), Some("p-2"));
}

#[tokio::test]
async fn save_replaces_whole_map() {
    let db = setup_test_db().await.unwrap();
    let repo = IdMappingRepository::new(db);

    let mut mapping = repo.load(5, "asana:tasks").await.unwrap();
    mapping.insert("t-1", 1);
    repo.save(&mapping).await.unwrap();

    let mut mapping = repo.load(5, "asana:tasks").await.unwrap();
    mapping.insert("t-2", 2);
    mapping.insert("t-1", 3);
    repo.save(&mapping).await.unwrap();

    let loaded = repo.load(5, "asana:tasks").await.unwrap();
    assert_eq!(loaded.data, mapping_of(&[("t-1", 3), ("t-2", 2)]));
}

#[tokio::test]
async fn mappings_are_scoped_by_workspace_and_key() {
    let db = setup_test_db().await.unwrap();
    let repo = IdMappingRepository::new(db);

    let mut mapping = IdMapping::new(5, "asana:users");
    mapping.insert("u-1", 10);
    repo.save(&mapping).await.unwrap();

    assert!(repo.load(6, "asana:users").await.unwrap().is_empty());
    assert!(repo.load(5, "asana:clients").await.unwrap().is_empty());

    repo.delete(5, "asana:users").await.unwrap();
    assert!(repo.load(5, "asana:users").await.unwrap().is_empty());
}
