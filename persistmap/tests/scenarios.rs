use persistmap::writer::{self, OpenMode};
use persistmap::{
    open_binding, Binding, BindingError, JsonStore, JsonStoreOptions, RowStore, RowStoreOptions,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn on_disk(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn json_store_lifecycle_on_new_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("urls.json");

    let urls = open_binding(&path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");

    urls.set("abc", json!({"fulllink": "http://x"})).unwrap();
    assert_eq!(urls.get("abc").unwrap(), Some(json!({"fulllink": "http://x"})));

    urls.delete("abc").unwrap();
    assert_eq!(urls.get("abc").unwrap(), None);

    let store = urls.as_json().unwrap();
    store.close().unwrap();
    assert_eq!(on_disk(&path), json!({}));
}

#[test]
fn relational_rows_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("urls.sqlite");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE urls (id TEXT PRIMARY KEY, fulllink TEXT, expiry TEXT);")
            .unwrap();
    }

    {
        let urls = RowStore::open(&path).unwrap();
        urls.set("k1", &json!({"fulllink": "http://y", "expiry": "2099-01-01"}))
            .unwrap();
    }

    let reopened = open_binding(&path).unwrap();
    assert_eq!(
        reopened.get("k1").unwrap(),
        Some(json!({"id": "k1", "fulllink": "http://y", "expiry": "2099-01-01"}))
    );
    assert_eq!(reopened.keys().unwrap(), vec!["k1".to_string()]);
}

#[test]
fn integer_keys_address_rows_by_value() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("hits.db");
    let store = RowStore::open_with(
        &path,
        RowStoreOptions {
            table: Some("hits".into()),
            bootstrap_ddl: Some("CREATE TABLE hits (n INTEGER PRIMARY KEY, label TEXT);".into()),
        },
    )
    .unwrap();

    store.set("5", &json!({"label": "five"})).unwrap();
    assert_eq!(store.get("05").unwrap().unwrap()["label"], json!("five"));

    store.set("05", &json!({"label": "still five"})).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["5".to_string()]);
    assert_eq!(store.get("5").unwrap().unwrap()["label"], json!("still five"));

    assert!(matches!(
        store.get("five"),
        Err(BindingError::Coercion { .. })
    ));
}

#[test]
fn reopening_reproduces_document() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("doc.json");
    let doc = json!({
        "abc": {"fulllink": "http://x", "expiry": null},
        "list": [1, "two", {"three": 3.5}],
        "flag": false
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let store = JsonStore::open(&path).unwrap();
    let mut keys = store.keys();
    keys.sort();
    assert_eq!(keys, vec!["abc", "flag", "list"]);
    for key in &keys {
        assert_eq!(store.get(key).as_ref(), doc.get(key));
    }
}

#[test]
fn rapid_sets_settle_on_last_state() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("counter.json");
    let store = JsonStore::open(&path).unwrap();

    for i in 0..100 {
        store.set("counter", json!(i)).unwrap();
        store.set(&format!("k{}", i % 10), json!(i)).unwrap();
    }
    store.flush().unwrap();
    // Let the watcher see our own writes and reconcile.
    std::thread::sleep(Duration::from_millis(400));

    let expected = json!({
        "counter": 99,
        "k0": 90, "k1": 91, "k2": 92, "k3": 93, "k4": 94,
        "k5": 95, "k6": 96, "k7": 97, "k8": 98, "k9": 99
    });
    assert_eq!(on_disk(&path), expected);
    assert_eq!(store.snapshot(), expected);
}

#[test]
fn concurrent_writers_never_expose_torn_json() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared.json");
    let options = JsonStoreOptions {
        watch: false,
        ..JsonStoreOptions::default()
    };
    let a = JsonStore::open_with(&path, options.clone()).unwrap();
    let b = JsonStore::open_with(&path, options).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let done = Arc::clone(&done);
        let path = path.clone();
        std::thread::spawn(move || {
            let mut reads = 0usize;
            while !done.load(Ordering::SeqCst) {
                let content = writer::read_shared(&path).unwrap();
                let parsed: Value = serde_json::from_str(&content)
                    .unwrap_or_else(|e| panic!("torn read {content:?}: {e}"));
                assert!(parsed.is_object());
                reads += 1;
            }
            reads
        })
    };

    let filler = "x".repeat(4096);
    let writers: Vec<_> = [("a", a.clone()), ("b", b.clone())]
        .into_iter()
        .map(|(name, store)| {
            let filler = filler.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .set(&format!("{name}{i}"), json!({"fulllink": filler}))
                        .unwrap();
                }
                store.flush().unwrap();
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    let last = on_disk(&path);
    assert!(last == a.snapshot() || last == b.snapshot());
}

#[test]
fn external_writer_is_merged_into_live_store() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("urls.json");
    let store = JsonStore::open(&path).unwrap();

    writer::write(
        &path,
        r#"{"abc":{"fulllink":"http://x"},"def":{"fulllink":"http://z"}}"#,
        OpenMode::Truncate,
    )
    .unwrap();

    let mut keys = Vec::new();
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(50));
        keys = store.keys();
        if keys.len() == 2 {
            break;
        }
    }
    assert_eq!(keys, vec!["abc", "def"]);

    // Local writes after reconciliation include the external entries.
    store.set("ghi", json!({"fulllink": "http://w"})).unwrap();
    store.flush().unwrap();
    assert_eq!(
        on_disk(&path),
        json!({
            "abc": {"fulllink": "http://x"},
            "def": {"fulllink": "http://z"},
            "ghi": {"fulllink": "http://w"}
        })
    );
}

#[test]
fn opening_during_a_rewrite_never_wipes_the_document() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("busy.json");
    let unwatched = JsonStoreOptions {
        watch: false,
        ..JsonStoreOptions::default()
    };

    let busy = JsonStore::open_with(&path, unwatched.clone()).unwrap();
    busy.set("big", json!("y".repeat(1 << 20))).unwrap();
    busy.flush().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let rewriter = {
        let done = Arc::clone(&done);
        let busy = busy.clone();
        std::thread::spawn(move || {
            let mut i = 0u64;
            while !done.load(Ordering::SeqCst) {
                busy.set("round", json!(i)).unwrap();
                busy.flush().unwrap();
                i += 1;
            }
        })
    };

    for _ in 0..50 {
        let opened = JsonStore::open_with(&path, unwatched.clone()).unwrap();
        assert!(opened.contains_key("big"), "opened without the existing document");
    }
    done.store(true, Ordering::SeqCst);
    rewriter.join().unwrap();

    busy.flush().unwrap();
    assert!(on_disk(&path).get("big").is_some());
}
