//! The Mailer capability: the dispatcher hands it a fully assembled
//! RFC 822 message; the production implementation relays it over SMTP.

use crate::config::SmtpConfig;
use crate::error::Result;
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &[String], message: &[u8]) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Option<Address>,
}

impl SmtpMailer {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.server.as_str())
                .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let from = match config.header("from") {
            "" => None,
            from => Some(from.parse::<Address>()?),
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &[String], message: &[u8]) -> Result<()> {
        let mut recipients = Vec::with_capacity(to.len());
        for recipient in to {
            recipients.push(recipient.parse::<Address>()?);
        }
        let envelope = Envelope::new(self.from.clone(), recipients)?;
        self.transport.send_raw(&envelope, message).await?;
        Ok(())
    }
}
