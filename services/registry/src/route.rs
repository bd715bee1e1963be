//! Parsing `/v2/...` paths
//!
//! Repository names may contain `/`, so the registry API cannot be expressed
//! with fixed route segments. Paths are split on the last keyword instead.

use auth::RegistryAction;
use axum::http::Method;

/// A registry API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/v2/`
    Base,
    /// `/v2/_catalog`
    Catalog,
    /// `/v2/<name>/tags/list`
    Tags {
        /// Repository
        name: String,
    },
    /// `/v2/<name>/manifests/<reference>`
    Manifest {
        /// Repository
        name: String,
        /// Tag or digest
        reference: String,
    },
    /// `/v2/<name>/blobs/<digest>`
    Blob {
        /// Repository
        name: String,
        /// Blob digest
        digest: String,
    },
    /// `/v2/<name>/blobs/uploads/`
    Uploads {
        /// Repository
        name: String,
    },
    /// `/v2/<name>/blobs/uploads/<id>`
    Upload {
        /// Repository
        name: String,
        /// Session id
        id: String,
    },
}

/// What a request needs to be allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Resource type, `repository` or `registry`
    pub kind: &'static str,
    /// Resource name
    pub name: String,
    /// Required action
    pub action: RegistryAction,
}

impl Route {
    /// Parse a request path. Returns `None` for paths outside the API.
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix("/v2")?;
        if rest.is_empty() || rest == "/" {
            return Some(Route::Base);
        }
        let rest = rest.strip_prefix('/')?;

        if rest == "_catalog" {
            return Some(Route::Catalog);
        }

        if let Some(name) = rest.strip_suffix("/tags/list") {
            return named(name, |name| Route::Tags { name });
        }

        if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
            if reference.is_empty() || reference.contains('/') {
                return None;
            }
            return named(name, |name| Route::Manifest {
                name,
                reference: reference.to_owned(),
            });
        }

        if let Some(name) = rest
            .strip_suffix("/blobs/uploads/")
            .or_else(|| rest.strip_suffix("/blobs/uploads"))
        {
            return named(name, |name| Route::Uploads { name });
        }

        if let Some((name, id)) = rest.rsplit_once("/blobs/uploads/") {
            if id.contains('/') {
                return None;
            }
            return named(name, |name| Route::Upload {
                name,
                id: id.to_owned(),
            });
        }

        if let Some((name, digest)) = rest.rsplit_once("/blobs/") {
            if digest.is_empty() || digest.contains('/') {
                return None;
            }
            return named(name, |name| Route::Blob {
                name,
                digest: digest.to_owned(),
            });
        }

        None
    }

    /// The repository this route addresses, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            Route::Base | Route::Catalog => None,
            Route::Tags { name }
            | Route::Manifest { name, .. }
            | Route::Blob { name, .. }
            | Route::Uploads { name }
            | Route::Upload { name, .. } => Some(name),
        }
    }

    /// The access needed to call this route with `method`. The base route
    /// only needs an authenticated caller.
    pub fn requirement(&self, method: &Method) -> Option<Requirement> {
        let action = match *method {
            Method::GET | Method::HEAD => RegistryAction::Pull,
            Method::DELETE => match self {
                Route::Upload { .. } => RegistryAction::Push,
                _ => RegistryAction::Delete,
            },
            _ => RegistryAction::Push,
        };

        match self {
            Route::Base => None,
            Route::Catalog => Some(Requirement {
                kind: "registry",
                name: "catalog".into(),
                action: RegistryAction::Pull,
            }),
            _ => self.repository().map(|name| Requirement {
                kind: "repository",
                name: name.to_owned(),
                action,
            }),
        }
    }
}

fn named(name: &str, route: impl FnOnce(String) -> Route) -> Option<Route> {
    if name.is_empty() {
        None
    } else {
        Some(route(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_names() {
        assert_eq!(Route::parse("/v2/"), Some(Route::Base));
        assert_eq!(Route::parse("/v2"), Some(Route::Base));
        assert_eq!(Route::parse("/v2/_catalog"), Some(Route::Catalog));
        assert_eq!(
            Route::parse("/v2/library/alpine/tags/list"),
            Some(Route::Tags {
                name: "library/alpine".into()
            })
        );
        assert_eq!(
            Route::parse("/v2/library/alpine/manifests/latest"),
            Some(Route::Manifest {
                name: "library/alpine".into(),
                reference: "latest".into()
            })
        );
        assert_eq!(
            Route::parse("/v2/a/blobs/b/blobs/sha256:abc"),
            Some(Route::Blob {
                name: "a/blobs/b".into(),
                digest: "sha256:abc".into()
            })
        );
        assert_eq!(
            Route::parse("/v2/org/app/blobs/uploads/"),
            Some(Route::Uploads {
                name: "org/app".into()
            })
        );
        assert_eq!(
            Route::parse("/v2/org/app/blobs/uploads/1234"),
            Some(Route::Upload {
                name: "org/app".into(),
                id: "1234".into()
            })
        );
    }

    #[test]
    fn rejects_other_paths() {
        for path in ["/v1/app", "/v2x", "/v2/app", "/v2//manifests/x", "/v2/app/blobs/"] {
            assert_eq!(Route::parse(path), None, "{path}");
        }
    }

    #[test]
    fn requirements_follow_method() {
        let route = Route::parse("/v2/app/manifests/v1").unwrap();
        assert_eq!(
            route.requirement(&Method::HEAD).unwrap().action,
            RegistryAction::Pull
        );
        assert_eq!(
            route.requirement(&Method::PUT).unwrap().action,
            RegistryAction::Push
        );
        assert_eq!(
            route.requirement(&Method::DELETE).unwrap().action,
            RegistryAction::Delete
        );

        let upload = Route::parse("/v2/app/blobs/uploads/abc").unwrap();
        assert_eq!(
            upload.requirement(&Method::DELETE).unwrap().action,
            RegistryAction::Push
        );
        assert_eq!(Route::Base.requirement(&Method::GET), None);
        assert_eq!(
            Route::Catalog.requirement(&Method::GET).unwrap().kind,
            "registry"
        );
    }
}
