use std::process;

use log::error;
use serde_json::{Map, Value};

use dhis2_sql_connector::Connector;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let sql = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if sql.trim().is_empty() {
        eprintln!("usage: dhis2-query <SELECT statement>");
        process::exit(2);
    }

    let connector = Connector::from_env().map_err(|e| {
        error!("Failed to initialize connector: {}", e);
        e
    })?;

    let result = match connector.execute_sql(&sql).await {
        Ok(result) => result,
        Err(e) => {
            error!("Query failed: {}", e);
            process::exit(1);
        }
    };
    if let Some(failure) = &result.partial_failure {
        eprintln!("warning: {}", failure);
    }

    for row in result.into_cursor() {
        let mut object = Map::new();
        for (name, value) in row.names().iter().zip(row.values()) {
            object.insert(name.clone(), serde_json::to_value(value)?);
        }
        println!("{}", Value::Object(object));
    }
    Ok(())
}
