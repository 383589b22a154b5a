use crate::AuthError;
use crate::AuthResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Bearer,
    Cookie,
    ApiKey,
    Anonymous,
}

/// Request shape the fingerprint checks look at. CSRF double-submit
/// applies only to cookie-authenticated calls; bearer and API-key
/// requests carry no ambient credentials a cross-site page could ride.
#[derive(Debug, Clone)]
pub struct RequestFingerprint {
    pub method: String,
    pub auth_kind: AuthKind,
    /// `Sec-Fetch-Site` as sent by the browser, when present.
    pub sec_fetch_site: Option<String>,
    pub csrf_cookie: Option<String>,
    pub csrf_header: Option<String>,
}

fn is_state_changing(method: &str) -> bool {
    matches!(
        method.to_ascii_uppercase().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

/// Fetch-Metadata first: a cross-site state-changing request is refused
/// outright. Cookie-authenticated state changes then require the
/// double-submit pair to match.
pub fn admit_fingerprint(fingerprint: &RequestFingerprint) -> AuthResult<()> {
    if !is_state_changing(&fingerprint.method) {
        return Ok(());
    }

    if fingerprint
        .sec_fetch_site
        .as_deref()
        .is_some_and(|site| site.eq_ignore_ascii_case("cross-site"))
    {
        return Err(AuthError::Forbidden(
            "cross-site state-changing request".into(),
        ));
    }

    if fingerprint.auth_kind == AuthKind::Cookie {
        let matched = match (&fingerprint.csrf_cookie, &fingerprint.csrf_header) {
            (Some(cookie), Some(header)) => !cookie.is_empty() && cookie == header,
            _ => false,
        };
        if !matched {
            return Err(AuthError::Forbidden("csrf token mismatch".into()));
        }
    }

    Ok(())
}
