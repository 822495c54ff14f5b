use crate::{
    api::handlers::{ErrorBody, health, test_db, user_show},
    broker::{DbIdentity, ErrorKind},
};
use utoipa::OpenApi;

// Info is filled from Cargo.toml metadata.
#[derive(OpenApi)]
#[openapi(
    paths(health::health, user_show::user_show, test_db::test_db),
    components(schemas(health::Health, DbIdentity, ErrorBody, ErrorKind)),
    tags(
        (name = "health", description = "Service metadata"),
        (name = "directory", description = "FreeIPA lookups as the delegated principal"),
        (name = "database", description = "PostgreSQL sessions as the delegated principal"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn documents_every_route() {
        let doc = openapi();
        for path in ["/health", "/user_show", "/test_db"] {
            assert!(doc.paths.paths.contains_key(path), "{path}");
        }
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn error_body_schema_is_registered() {
        let doc = openapi();
        let schemas = doc.components.map(|c| c.schemas).unwrap_or_default();
        assert!(schemas.contains_key("ErrorBody"));
        assert!(schemas.contains_key("DbIdentity"));
    }
}
