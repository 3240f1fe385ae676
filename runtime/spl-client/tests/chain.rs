use bytes::Bytes;
use spl_client::{
    AppliesTo, Error, ErrorKind, ExtensionDescriptor, ExtensionLibrary, ExtensionModule,
    MountFile, Source, Spl, SplConfig, SplOptions, Step, Target, Value,
};
use std::time::Duration;
use tokio::time::timeout;

async fn spawn() -> Spl {
    Spl::spawn(SplConfig::new()).await.expect("spawn")
}

#[tokio::test]
async fn repeated_positional_parameter_binds_once() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let rows = db
        .exec("select ?1 a, ?1 b", [1])
        .get()
        .rows()
        .await
        .expect("rows");
    assert_eq!(rows, vec![vec![Value::from(1), Value::from(1)]]);
}

#[tokio::test]
async fn nested_lists_execute_once_per_element() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let rows = db
        .exec("select ? a", vec![vec![1], vec![2]])
        .get()
        .rows()
        .await
        .expect("rows");
    assert_eq!(rows, vec![vec![Value::from(1)], vec![Value::from(2)]]);
    let flat = db
        .exec("select ? a", [1, 2])
        .get()
        .flat()
        .await
        .expect("flat");
    assert_eq!(flat, vec![Value::from(1), Value::from(2)]);
}

#[tokio::test]
async fn named_parameters_bind_by_name() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let first = db
        .exec("select @a + 1 x", Value::map([("@a", 41)]))
        .get()
        .first()
        .await
        .expect("first");
    assert_eq!(first, Value::from(42));
}

#[tokio::test]
async fn blobs_round_trip_byte_for_byte() {
    let spl = Spl::spawn(SplConfig::new().options(SplOptions::default().without_geojson()))
        .await
        .expect("spawn");
    let db = spl.db(Source::Memory);
    let blob = Bytes::from_static(&[0, 1, 2, 255]);
    let first = db
        .exec("select ? b", blob.clone())
        .get()
        .first()
        .await
        .expect("first");
    assert_eq!(first, Value::Blob(blob));
    db.get().free().await.expect("free");
    assert!(db.get().rows().await.expect("rows").is_empty());
}

#[tokio::test]
async fn json_text_columns_decode_as_values() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let objs = db
        .exec(r#"select '{"k":[1,2]}' j, 'plain' p"#, ())
        .get()
        .objs()
        .await
        .expect("objs");
    assert_eq!(objs.len(), 1);
    assert_eq!(objs[0]["j"], Value::map([("k", vec![1, 2])]));
    assert_eq!(objs[0]["p"], Value::from("plain"));
}

#[tokio::test]
async fn duplicate_column_names_are_suffixed() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let cols = db
        .exec("select 1 a, 2 a, 3 b", ())
        .get()
        .cols()
        .await
        .expect("cols");
    assert_eq!(cols, vec!["a", "a1", "b"]);
}

#[tokio::test]
async fn closed_handles_report_closed() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    assert!(db.close().await.expect("close").is_this());
    let err = db.exec("select 1", ()).await.err().expect("closed");
    assert_eq!(err.to_string(), "Database closed");
    assert_eq!(err.kind(), Some(ErrorKind::ResourceState));
    let again = db.close().await.err().expect("double close");
    assert_eq!(again.to_string(), "Database closed");
}

#[tokio::test]
async fn failures_abort_the_rest_of_the_batch() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let err = db
        .read("create table t (v)")
        .exec("insert into missing values (1)", ())
        .exec("insert into t values (1)", ())
        .await
        .err()
        .expect("failure");
    assert!(err.to_string().contains("no such table"));
    assert_eq!(err.kind(), Some(ErrorKind::Engine));
    let count = db
        .exec("select count(*) from t", ())
        .get()
        .first()
        .await
        .expect("count");
    assert_eq!(count, Value::from(0));
}

#[tokio::test]
async fn awaiting_an_empty_chain_sends_nothing() {
    let spl = spawn().await;
    assert!((&spl).await.expect("empty").is_this());
    let db = spl.db(Source::Memory);
    assert!((&db).await.expect("open").is_this());
    assert!((&db).await.expect("empty").is_this());
}

#[tokio::test]
async fn saved_images_reopen_with_the_same_rows() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let image = db
        .read("create table t (v); insert into t values (7)")
        .save(None)
        .await
        .expect("save")
        .into_value()
        .and_then(|value| value.as_bytes().cloned())
        .expect("image");
    assert!(image.starts_with(b"SQLite format 3"));
    let copy = spl.db(image);
    let rows = copy
        .exec("select v from t", ())
        .get()
        .rows()
        .await
        .expect("rows");
    assert_eq!(rows, vec![vec![Value::from(7)]]);
}

#[tokio::test]
async fn filesystem_reads_return_what_was_saved() {
    let root = tempfile::tempdir().expect("root");
    let spl = Spl::spawn(SplConfig::new().root(root.path()))
        .await
        .expect("spawn");
    spl.fs().mkdir("/out");
    let db = spl.db(Source::Memory);
    db.read("create table t (v)").save(Some("/out/t.db")).await.expect("save");
    assert_eq!(spl.fs().dir("/out").await.expect("dir"), vec!["t.db"]);
    let bytes = spl.fs().file("/out/t.db").await.expect("file");
    assert_eq!(bytes, std::fs::read(root.path().join("out/t.db")).expect("host"));
    spl.fs().unlink("/out/t.db");
    assert!(spl.fs().dir("/out").await.expect("dir").is_empty());
}

#[tokio::test]
async fn mounted_buffers_can_be_loaded() {
    let spl = spawn().await;
    let source = spl.db(Source::Memory);
    let image = source
        .read("create table t (v); insert into t values ('x')")
        .save(None)
        .await
        .expect("save")
        .into_value()
        .and_then(|value| value.as_bytes().cloned())
        .expect("image");
    spl.fs()
        .mount("", Some("/inputs"), vec![MountFile::new("t.db", image)]);
    let db = spl.db(Source::Memory);
    let first = db
        .load("/inputs/t.db")
        .exec("select v from t", ())
        .get()
        .first()
        .await
        .expect("first");
    assert_eq!(first, Value::from("x"));
}

#[tokio::test]
async fn top_level_commands_travel_with_the_next_connection() {
    let spl = spawn().await;
    spl.fs().mkdir("/data");
    let db = spl.db("/data/a.db");
    db.read("create table t (v)").await.expect("create");
    assert_eq!(spl.fs().dir("/data").await.expect("dir"), vec!["a.db"]);
}

#[tokio::test]
async fn sync_moves_the_result_locally() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    let view = db
        .exec("select 1 a, 'x' b union all select 2, 'y'", ())
        .get()
        .sync()
        .await
        .expect("sync");
    assert_eq!(view.cols(), &["a".to_string(), "b".to_string()]);
    assert_eq!(view.rows().len(), 2);
    assert!(db.get().rows().await.expect("rows").is_empty());
}

#[tokio::test]
async fn version_reports_the_engine() {
    let spl = spawn().await;
    let version = spl
        .version()
        .await
        .expect("version")
        .into_value()
        .expect("value");
    let map = version.as_map().expect("map");
    assert!(map["sqlite"].as_str().is_some_and(|v| v.starts_with('3')));
}

fn user_version(target: Target<'_>, _: Vec<Value>) -> spl_db::Result<Step> {
    match target {
        Target::Db(db) => {
            let version: i64 = db
                .connection()?
                .query_row("pragma user_version", [], |row| row.get(0))?;
            Ok(Step::value(version))
        }
        Target::Spl(_) => Ok(Step::value(Value::Null)),
    }
}

#[tokio::test]
async fn connection_extensions_see_the_live_connection() {
    let library = ExtensionLibrary::new().register(
        "pragmas",
        ExtensionModule::new().export("user_version", user_version),
    );
    let config = SplConfig::new()
        .library(library)
        .extension(ExtensionDescriptor::new(AppliesTo::Db, "pragmas").function("version", "user_version"));
    let spl = Spl::spawn(config).await.expect("spawn");
    let db = spl.db(Source::Memory);
    let version = db
        .read("pragma user_version = 5")
        .call("version", Vec::new())
        .await
        .expect("call")
        .into_value()
        .expect("value");
    assert_eq!(version, Value::from(5));
    let err = db.call("missing", Vec::new()).await.err().expect("unknown");
    assert_eq!(err.to_string(), "Unknown function 'db.missing'");
}

#[tokio::test]
async fn unresolvable_extensions_fail_to_spawn() {
    let config = SplConfig::new()
        .extension(ExtensionDescriptor::new(AppliesTo::Spl, "absent").function("f", "g"));
    let err = Spl::spawn(config).await.err().expect("init");
    assert!(matches!(err, Error::Init(_)));
}

#[tokio::test]
async fn terminate_fails_later_batches() {
    let spl = spawn().await;
    let db = spl.db(Source::Memory);
    spl.terminate();
    assert!(matches!((&db).await, Err(Error::Terminated)));
}

fn explode(_: Target<'_>, _: Vec<Value>) -> spl_db::Result<Step> {
    panic!("extension exploded");
}

#[tokio::test]
async fn crashed_contexts_fail_every_waiting_batch() {
    let library = ExtensionLibrary::new()
        .register("boom", ExtensionModule::new().export("explode", explode));
    let config = SplConfig::new()
        .library(library)
        .extension(ExtensionDescriptor::new(AppliesTo::Spl, "boom").function("explode", "explode"));
    let spl = Spl::spawn(config).await.expect("spawn");
    let crashed = timeout(Duration::from_secs(5), async { spl.call("explode", Vec::new()).await })
        .await
        .expect("settled")
        .err()
        .expect("crash");
    assert_eq!(crashed.kind(), Some(ErrorKind::Transport));
    assert!(crashed.to_string().contains("extension exploded"));

    let later = timeout(Duration::from_secs(5), async { spl.version().await })
        .await
        .expect("settled");
    assert!(matches!(later, Err(Error::Terminated)));
}
