use jsonwebtoken::Algorithm;

/// Runtime configuration for token verification.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Expected issuer claim (iss). Empty disables the check.
    pub issuer: Option<String>,
    /// Expected audience claim (aud). Empty disables the check.
    pub audience: Option<String>,
    /// Allowable clock skew in seconds when validating exp/nbf.
    pub leeway_seconds: u32,
    /// Header `alg` values the operator accepts. The header's declared
    /// algorithm is only honoured after membership here is confirmed.
    pub allowed_algorithms: Vec<Algorithm>,
}

impl JwtConfig {
    pub fn new() -> Self {
        Self {
            issuer: None,
            audience: None,
            leeway_seconds: 30,
            allowed_algorithms: vec![Algorithm::RS256],
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    pub fn with_allowed_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = algorithms;
        self
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self::new()
    }
}
