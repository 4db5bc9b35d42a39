use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;
use crate::usage::SYSTEM_TENANT;

use super::{Claims, Identity, IdentityVerifier};

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

impl IdentityVerifier for JwtValidator {
    fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let claims = self.validate(token)?;

        if claims.user_id().is_empty() {
            return Err(AppError::Auth("Token has no subject".to_string()));
        }

        let tenant_id = claims
            .tenant_id()
            .ok_or_else(|| AppError::Auth("Token has no tenant_id".to_string()))?;

        // Tenant ids become topic segments and usage scopes.
        if tenant_id == SYSTEM_TENANT
            || tenant_id.contains(|c: char| matches!(c, '.' | '*' | '?' | '[' | ']') || c.is_whitespace())
        {
            return Err(AppError::Auth(format!("Invalid tenant_id: {}", tenant_id)));
        }

        Ok(Identity::new(tenant_id, claims.user_id()))
    }
}
