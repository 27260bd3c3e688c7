use log::{error, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use thiserror::Error;
use tokio_postgres::Client;
use url::Url;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("invalid database URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("TLS setup error: {0}")]
    Tls(String),
}

pub fn create_ssl_connector(
    sslrootcert_path: Option<&str>,
) -> Result<MakeTlsConnector, StorageError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| StorageError::Tls(format!("SSL builder error: {}", e)))?;

    if let Some(path) = sslrootcert_path {
        builder
            .set_ca_file(path)
            .map_err(|e| StorageError::Tls(format!("Error loading CA cert: {}", e)))?;
    }

    builder.set_verify(SslVerifyMode::NONE); // TEMPORARY FOR SELF-SIGNED CERTS

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Open a fresh connection to the database.
///
/// The `sslrootcert` query parameter is not understood by tokio-postgres, so
/// it is stripped from the URL and fed to the TLS connector instead. The
/// connection driver runs as its own task until the link drops.
pub async fn connect_client(database_url: &str) -> Result<Client, StorageError> {
    let url = Url::parse(database_url)?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    let connector = create_ssl_connector(sslrootcert_path.as_deref())?;

    let (client, connection) = tokio_postgres::connect(clean_url.as_str(), connector).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Database connection error: {}", e);
        }
    });

    Ok(client)
}

/// Hand back a usable client, reconnecting when the cached one is gone or
/// its connection has dropped. The slot lives behind the storage mutex, so
/// each caller holds it only for the duration of a single operation.
pub async fn ensure_client<'a>(
    database_url: &str,
    slot: &'a mut Option<Client>,
) -> Result<&'a Client, StorageError> {
    let stale = slot.as_ref().map_or(true, |client| client.is_closed());
    if stale {
        if slot.is_some() {
            warn!("Database connection lost, reconnecting");
        }
        *slot = Some(connect_client(database_url).await?);
    }

    match slot.as_ref() {
        Some(client) => Ok(client),
        None => Err(StorageError::Tls("client slot empty after connect".into())),
    }
}
