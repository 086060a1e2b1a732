pub mod password;
pub mod token;
pub mod validation;

pub use password::{hash_password, verify_password, verify_password_blocking};
pub use token::{hash_token, token_matches};
pub use validation::ValidatedJson;
