//! Integration tests against MySQL and PostgreSQL servers.
//!
//! Set TEST_MYSQL_URL or TEST_POSTGRES_URL to run them; otherwise they skip.

use rowbase::config::{PoolSettings, parse_database_url};
use rowbase::db::DataHandler;
use rowbase::impl_entity;
use rowbase::models::{ColumnDef, ConnectionConfig, QueryFilter, RowState};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct Note {
    id: i32,
    title: String,
    body: String,
    tags: Vec<String>,
    state: RowState,
}

impl_entity!(Note, state, table = "rowbase_notes", {
    id => ColumnDef::primary().auto_increment(),
    title => ColumnDef::unique(),
    body => ColumnDef::normal(),
    tags => ColumnDef::normal(),
});

/// Keyless rows take the bulk copy path on PostgreSQL.
#[derive(Debug, Default, Clone)]
struct Reading {
    sensor: String,
    value: f64,
    meta: BTreeMap<String, String>,
    state: RowState,
}

impl_entity!(Reading, state, table = "rowbase_readings", {
    sensor => ColumnDef::normal(),
    value => ColumnDef::normal(),
    meta => ColumnDef::normal(),
});

async fn connect(url: &str) -> DataHandler {
    let mut config: ConnectionConfig = parse_database_url(url).unwrap();
    config.pool = PoolSettings {
        min_pool_size: Some(1),
        max_pool_size: Some(4),
        ..config.pool
    };
    let handler = DataHandler::connect(config).await.unwrap();
    for table in ["rowbase_notes", "rowbase_readings"] {
        let mut conn = handler.pool().acquire().await.unwrap();
        conn.connection()
            .unwrap()
            .execute(&format!("DROP TABLE IF EXISTS {table}"), &[])
            .await
            .unwrap();
    }
    handler
}

async fn exercise_notes(handler: &DataHandler) {
    let mut notes = vec![
        Note {
            title: "你好".into(),
            body: "世界 🌍".into(),
            tags: vec!["中文".into(), "emoji".into()],
            ..Note::default()
        },
        Note {
            title: "plain".into(),
            body: "ascii".into(),
            ..Note::default()
        },
    ];
    handler.insert_all(&mut notes).await.unwrap();
    assert_eq!(notes[0].id, 1);
    assert_eq!(notes[1].id, 2);

    let stored: Note = handler
        .load_one(&QueryFilter::new().equals("title", "你好"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.body, "世界 🌍");
    assert_eq!(stored.tags, vec!["中文", "emoji"]);

    notes[1].body = "changed".into();
    assert!(handler.update_row(&notes[1]).await.unwrap());
    assert!(handler.exists(&notes[1]).await.unwrap());
    assert_eq!(handler.count::<Note>(&QueryFilter::new()).await.unwrap(), 2);

    let last: Note = handler.load_last().await.unwrap().unwrap();
    assert_eq!(last.body, "changed");

    handler.remove::<Note>(&QueryFilter::new()).await.unwrap();
    assert_eq!(handler.count::<Note>(&QueryFilter::new()).await.unwrap(), 0);
}

async fn exercise_readings(handler: &DataHandler) {
    let mut readings: Vec<Reading> = (0..200)
        .map(|i| Reading {
            sensor: format!("s-{}", i % 7),
            value: f64::from(i) / 4.0,
            meta: BTreeMap::from([("unit".to_string(), "°C, \"raw\"".to_string())]),
            ..Reading::default()
        })
        .collect();
    handler.insert_all(&mut readings).await.unwrap();
    assert_eq!(handler.count::<Reading>(&QueryFilter::new()).await.unwrap(), 200);

    let sample: Reading = handler
        .load_one(&QueryFilter::new().equals("sensor", "s-3").asc("value"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.value, 0.75);
    assert_eq!(sample.meta.get("unit").map(String::as_str), Some("°C, \"raw\""));
}

#[tokio::test]
async fn test_mysql_entities() {
    let url = match std::env::var("TEST_MYSQL_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_MYSQL_URL not set");
            return;
        }
    };
    let handler = connect(&url).await;
    exercise_notes(&handler).await;
    exercise_readings(&handler).await;
    handler.shutdown().await;
}

#[tokio::test]
async fn test_postgres_entities() {
    let url = match std::env::var("TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_POSTGRES_URL not set");
            return;
        }
    };
    let handler = connect(&url).await;
    exercise_notes(&handler).await;
    exercise_readings(&handler).await;
    handler.shutdown().await;
}
