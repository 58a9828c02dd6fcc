use log::{error, info};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, NoTls, Socket};
use url::Url;

use crate::database::StoreError;
use crate::retry::retry;

/// TLS connector trusting the CA bundle at `sslrootcert_path`
///
/// The server certificate must chain to that CA.
fn ssl_connector(sslrootcert_path: &str) -> Result<SslConnector, StoreError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| StoreError::Connection(format!("SSL builder error: {}", e)))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| StoreError::Connection(format!("Error loading CA cert: {}", e)))?;
    builder.set_verify(SslVerifyMode::PEER);

    Ok(builder.build())
}

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, StoreError> {
    Ok(MakeTlsConnector::new(ssl_connector(sslrootcert_path)?))
}

/// Split the `sslrootcert` parameter off a connection URL
///
/// tokio-postgres rejects unknown parameters, so the CA path is handled here
/// and the rest of the query string is passed through untouched.
pub fn split_sslrootcert(database_url: &str) -> Result<(String, Option<String>), StoreError> {
    let url = Url::parse(database_url)
        .map_err(|e| StoreError::Connection(format!("URL parse error: {}", e)))?;

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

    Ok((clean_url.to_string(), sslrootcert_path))
}

async fn connect_with<T>(url: &str, tls: T) -> Result<(Client, JoinHandle<()>), StoreError>
where
    T: MakeTlsConnect<Socket> + 'static,
    T::Stream: Send + 'static,
{
    let (client, connection) = tokio_postgres::connect(url, tls).await?;
    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });
    Ok((client, handle))
}

/// Connect to PostgreSQL, retrying up to `attempts` times
///
/// TLS is used when the URL carries an `sslrootcert` parameter. The returned
/// handle drives the connection and finishes once the client is dropped.
pub async fn connect(database_url: &str, attempts: usize) -> Result<(Client, JoinHandle<()>), StoreError> {
    let (url, sslrootcert_path) = split_sslrootcert(database_url)?;

    let tls = match &sslrootcert_path {
        Some(path) => Some(create_ssl_connector(path)?),
        None => None,
    };

    let conn = retry(attempts, "PostgreSQL connect", || {
        let tls = tls.clone();
        let url = url.as_str();
        async move {
            match tls {
                Some(tls) => connect_with(url, tls).await,
                None => connect_with(url, NoTls).await,
            }
        }
    })
    .await?;

    info!(
        "Connected to PostgreSQL{}",
        if tls.is_some() { " over TLS" } else { "" }
    );
    Ok(conn)
}
