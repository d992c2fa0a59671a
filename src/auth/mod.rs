mod store;

pub use store::{CredentialStore, TOKEN_ISSUE_PATH, TOKEN_REFRESH_PATH};
