//! End-to-end scenarios: one source text, both schema and procedures,
//! executed against the real back ends.

use prose_db::{Engine, SqliteStore, StorageAdapter, StoreConfig};
use serde_json::{json, Value as JsonValue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn args(pairs: &[(&str, JsonValue)]) -> serde_json::Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn record(pairs: &[(&str, &str)]) -> prose_db::RawRecord {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), JsonValue::String(v.to_string())))
        .collect()
}

async fn sqlite_engine(source: &str) -> Engine {
    init_tracing();
    let mut engine = Engine::open_sqlite(StoreConfig::in_memory()).await.unwrap();
    engine.parse(source).await.unwrap();
    engine
}

async fn snapshot_engine(source: &str) -> Engine {
    let mut engine = Engine::open_snapshot(StoreConfig::in_memory())
        .await
        .unwrap();
    engine.parse(source).await.unwrap();
    engine
}

// ----------------------------------------------------------------------
// S1 — CRUD with exact decimals
// ----------------------------------------------------------------------

const CRUD_SOURCE: &str = "\
Item {
    number:id [primary]
    str[50]:name
    number[10.2]:price
}

CreateItem(number:id, str[50]:name, number:price):
    Create a Item with id of {id} and name of {name} and price of {price} as item
    return {item}

UpdatePrice(number:id, number:new_price):
    Get a Item by id of {id} as item
    Update the item to set price = {new_price}
    return {item}
";

#[tokio::test]
async fn s1_crud_roundtrip() {
    let engine = sqlite_engine(CRUD_SOURCE).await;
    let created = engine
        .invoke(
            "CreateItem",
            args(&[
                ("id", json!(1)),
                ("name", json!("Sword")),
                ("price", json!("100.50")),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(created["price"], json!("100.50"));

    // The persisted row carries the zero-padded text form.
    let row = engine
        .adapter()
        .lock()
        .await
        .find_one("Item", &record(&[("id", "1")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["price"], json!("100.50"));

    let updated = engine
        .invoke(
            "UpdatePrice",
            args(&[("id", json!(1)), ("new_price", json!("150.00"))]),
        )
        .await
        .unwrap();
    assert_eq!(updated["price"], json!("150.00"));

    let row = engine
        .adapter()
        .lock()
        .await
        .find_one("Item", &record(&[("id", "1")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["price"], json!("150.00"));
}

#[tokio::test]
async fn s1_crud_roundtrip_on_snapshot() {
    let engine = snapshot_engine(CRUD_SOURCE).await;
    engine
        .invoke(
            "CreateItem",
            args(&[
                ("id", json!(1)),
                ("name", json!("Sword")),
                ("price", json!("100.50")),
            ]),
        )
        .await
        .unwrap();
    let updated = engine
        .invoke(
            "UpdatePrice",
            args(&[("id", json!(1)), ("new_price", json!("150.00"))]),
        )
        .await
        .unwrap();
    assert_eq!(updated["price"], json!("150.00"));
}

// ----------------------------------------------------------------------
// S2 — rollback on a mid-procedure failure
// ----------------------------------------------------------------------

const ROLLBACK_SOURCE: &str = "\
Account {
    number:id [primary]
    number[10.2]:balance
}

RiskyTransfer(number:id, number:amount):
    Get a Account by id of {id} as acct
    Update the acct to set balance = {amount}
    Set {oops} = {undefined_variable}
    return {acct}
";

#[tokio::test]
async fn s2_failed_procedure_rolls_back() {
    let engine = sqlite_engine(ROLLBACK_SOURCE).await;
    engine
        .adapter()
        .lock()
        .await
        .insert("Account", &record(&[("id", "1"), ("balance", "500.00")]))
        .await
        .unwrap();

    let err = engine
        .invoke(
            "RiskyTransfer",
            args(&[("id", json!(1)), ("amount", json!("2000.00"))]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "resolution");

    let row = engine
        .adapter()
        .lock()
        .await
        .find_one("Account", &record(&[("id", "1")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["balance"], json!("500.00"));
}

#[tokio::test]
async fn s2_failed_procedure_rolls_back_on_snapshot() {
    let engine = snapshot_engine(ROLLBACK_SOURCE).await;
    engine
        .adapter()
        .lock()
        .await
        .insert("Account", &record(&[("id", "1"), ("balance", "500.00")]))
        .await
        .unwrap();

    engine
        .invoke(
            "RiskyTransfer",
            args(&[("id", json!(1)), ("amount", json!("2000.00"))]),
        )
        .await
        .unwrap_err();

    let row = engine
        .adapter()
        .lock()
        .await
        .find_one("Account", &record(&[("id", "1")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["balance"], json!("500.00"));
}

// ----------------------------------------------------------------------
// S3 — If/else fallthrough
// ----------------------------------------------------------------------

const CLASSIFY_SOURCE: &str = "\
Unused {
    number:id [primary]
}

Classify(number:val):
    If {val} is greater than 10:
        return \"High\"
    If {val} is less than 5:
        return \"Low\"
    return \"Medium\"
";

#[tokio::test]
async fn s3_if_else_fallthrough() {
    let engine = sqlite_engine(CLASSIFY_SOURCE).await;
    for (input, expected) in [(20, "High"), (2, "Low"), (7, "Medium")] {
        let out = engine
            .invoke("Classify", args(&[("val", json!(input))]))
            .await
            .unwrap();
        assert_eq!(out, json!(expected), "input {input}");
    }
}

// ----------------------------------------------------------------------
// S4 — lazy many-to-many traversal
// ----------------------------------------------------------------------

const BLOG_SOURCE: &str = "\
User {
    number:id [primary]
    str[50]:name
    List[Post]:posts
}

Post {
    number:id [primary]
    str[100]:title
}

GetUser(number:id):
    Get a User by id of {id} as user
    return {user}

GetUserPosts(number:id):
    Get a User by id of {id} as user
    return {user.posts}
";

async fn seed_blog(engine: &Engine) {
    let adapter = engine.adapter();
    let mut guard = adapter.lock().await;
    guard
        .insert("User", &record(&[("id", "1"), ("name", "Blogger")]))
        .await
        .unwrap();
    guard
        .insert("Post", &record(&[("id", "101"), ("title", "First Post")]))
        .await
        .unwrap();
    guard
        .insert("Post", &record(&[("id", "102"), ("title", "Second Post")]))
        .await
        .unwrap();
    for post_id in ["101", "102"] {
        guard
            .insert(
                "post_user",
                &record(&[("post_id", post_id), ("user_id", "1")]),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn s4_unread_relations_stay_out_of_the_tree() {
    let engine = sqlite_engine(BLOG_SOURCE).await;
    seed_blog(&engine).await;

    let user = engine
        .invoke("GetUser", args(&[("id", json!(1))]))
        .await
        .unwrap();
    assert_eq!(user["name"], json!("Blogger"));
    assert!(
        user.get("posts").is_none(),
        "unresolved relation must be omitted, got {user}"
    );
}

#[tokio::test]
async fn s4_relation_traversal_returns_both_posts() {
    let engine = sqlite_engine(BLOG_SOURCE).await;
    seed_blog(&engine).await;

    let posts = engine
        .invoke("GetUserPosts", args(&[("id", json!(1))]))
        .await
        .unwrap();
    let mut posts = posts.as_array().unwrap().clone();
    assert_eq!(posts.len(), 2);
    posts.sort_by_key(|p| p["id"].as_str().unwrap().parse::<i64>().unwrap());
    assert_eq!(posts[0]["title"], json!("First Post"));
    assert_eq!(posts[1]["title"], json!("Second Post"));
}

// ----------------------------------------------------------------------
// S5/S6 — orphan removal through junction triggers
// ----------------------------------------------------------------------

const SCHOOL_SOURCE: &str = "\
Class {
    number:id [primary]
}

Student (Class) {
    number:id [primary]
    List[Class]:classes
}
";

#[tokio::test]
async fn s5_single_owner_orphan_gc() {
    let mut store = SqliteStore::in_memory();
    store.init().await.unwrap();
    prose_db::schema::ingest(SCHOOL_SOURCE, &mut store)
        .await
        .unwrap();

    store.insert("Class", &record(&[("id", "201")])).await.unwrap();
    store
        .insert("Student", &record(&[("id", "201")]))
        .await
        .unwrap();
    store
        .insert(
            "class_student",
            &record(&[("class_id", "201"), ("student_id", "201")]),
        )
        .await
        .unwrap();

    // Raw SQL reaches the same trigger as any other mutation path.
    store
        .execute_raw("DELETE FROM \"class_student\" WHERE \"student_id\" = '201'")
        .await
        .unwrap();
    let student = store
        .find_one("Student", &record(&[("id", "201")]))
        .await
        .unwrap();
    assert!(student.is_none(), "orphaned student must be reclaimed");
}

const TAGGING_SOURCE: &str = "\
Post {
    number:id [primary]
}

User {
    number:id [primary]
}

Tag (Post, User) {
    number:id [primary]
    List[Post]:posts
    List[User]:users
}
";

#[tokio::test]
async fn s6_multi_owner_orphan_gc_waits_for_last_link() {
    let mut store = SqliteStore::in_memory();
    store.init().await.unwrap();
    prose_db::schema::ingest(TAGGING_SOURCE, &mut store)
        .await
        .unwrap();

    store.insert("Post", &record(&[("id", "301")])).await.unwrap();
    store.insert("User", &record(&[("id", "301")])).await.unwrap();
    store.insert("Tag", &record(&[("id", "301")])).await.unwrap();
    store
        .insert(
            "post_tag",
            &record(&[("post_id", "301"), ("tag_id", "301")]),
        )
        .await
        .unwrap();
    store
        .insert(
            "tag_user",
            &record(&[("tag_id", "301"), ("user_id", "301")]),
        )
        .await
        .unwrap();

    store
        .execute_raw("DELETE FROM \"post_tag\" WHERE \"tag_id\" = '301'")
        .await
        .unwrap();
    let tag = store.find_one("Tag", &record(&[("id", "301")])).await.unwrap();
    assert!(tag.is_some(), "tag still has a user link");

    store
        .execute_raw("DELETE FROM \"tag_user\" WHERE \"tag_id\" = '301'")
        .await
        .unwrap();
    let tag = store.find_one("Tag", &record(&[("id", "301")])).await.unwrap();
    assert!(tag.is_none(), "last link dropped; tag must be reclaimed");
}

// ----------------------------------------------------------------------
// S7 — ForEach sum with exact decimals
// ----------------------------------------------------------------------

const CART_SOURCE: &str = "\
Product {
    number:id [primary]
    number[10.2]:price
}

Cart {
    number:id [primary]
    List[Product]:products
}

CalculateTotal(number:id):
    Get a Cart by id of {id} as cart
    Set {total} = 0
    For Each p in {cart.products}:
        Set {total} = {total} + {p.price}
    return {total}
";

#[tokio::test]
async fn s7_for_each_sums_exactly() {
    let engine = sqlite_engine(CART_SOURCE).await;
    {
        let adapter = engine.adapter();
        let mut guard = adapter.lock().await;
        for (id, price) in [("1", "10.50"), ("2", "20.00"), ("3", "5.50")] {
            guard
                .insert("Product", &record(&[("id", id), ("price", price)]))
                .await
                .unwrap();
        }
        guard.insert("Cart", &record(&[("id", "1")])).await.unwrap();
        for product_id in ["1", "2", "3"] {
            guard
                .insert(
                    "cart_product",
                    &record(&[("cart_id", "1"), ("product_id", product_id)]),
                )
                .await
                .unwrap();
        }
    }

    let total = engine
        .invoke("CalculateTotal", args(&[("id", json!(1))]))
        .await
        .unwrap();
    assert_eq!(total, json!("36.00"));
}

#[tokio::test]
async fn for_each_over_missing_relation_sums_zero() {
    let engine = sqlite_engine(CART_SOURCE).await;
    engine
        .adapter()
        .lock()
        .await
        .insert("Cart", &record(&[("id", "7")]))
        .await
        .unwrap();
    let total = engine
        .invoke("CalculateTotal", args(&[("id", json!(7))]))
        .await
        .unwrap();
    assert_eq!(total, json!("0"));
}
