// Collaborator implementations backed by PostgreSQL and SMTP

pub mod email;
pub mod entities;
pub mod notifications;

pub use email::{EmailTemplate, LogEmailSink, SmtpEmailSink};
pub use entities::PgEntityStore;
pub use notifications::{PgNotificationSink, PgTaskSink};
