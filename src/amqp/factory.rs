use crate::amqp::configuration::RabbitMqSettings;
use crate::broker::{Broker, Connector, LapinBroker};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Opens connections to a RabbitMq broker.
///
/// `ConnectionFactory` is the [`Connector`] to hand to a [`Consumer`](crate::consumers::Consumer)
/// when talking to a real broker: every successful [`Connector::connect`] returns a fresh
/// [`LapinBroker`] wrapping its own connection.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = match &settings.tls {
            None => None,
            Some(tls_settings) => {
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    builder.add_root_certificate(certificate);
                }
                let connector = builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq.")?;
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.host.clone());
                Some(Arc::new(Tls {
                    connector,
                    domain_name,
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls,
        })
    }

    /// Open a new connection to the broker, bounded by the configured connection timeout.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .context("Timed out while connecting to RabbitMq.")??;
        connection.on_error(|e| {
            warn!(error = ?e, "RabbitMq connection broken");
        });
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake against the expected domain.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn Broker>, anyhow::Error> {
        let connection = self.new_connection().await?;
        Ok(Arc::new(LapinBroker::new(connection)))
    }
}
