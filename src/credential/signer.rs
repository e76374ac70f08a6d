//! HS256 credential issuance, verification, and refresh.

// std
use std::{
	collections::BTreeSet,
	fmt::{Debug, Formatter, Result as FmtResult},
};
// crates.io
use base64::prelude::*;
use jsonwebtoken::{
	Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind as JwtErrorKind,
};
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::SigningConfig,
	credential::{Claims, RevocationList, TokenKind},
	metrics, security,
};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Freshly minted credential together with the claims it encodes.
#[derive(Clone, Debug)]
pub struct IssuedCredential {
	/// Compact JWS string handed to the client.
	pub token: String,
	/// Claims signed into `token`.
	pub claims: Claims,
}
impl IssuedCredential {
	/// Expiry of the credential.
	pub fn expires_at(&self) -> DateTime<Utc> {
		self.claims.exp
	}
}

/// Mints and verifies bearer credentials under one shared secret.
///
/// The signer holds no mutable state of its own; the revocation list is the only shared,
/// mutable input and is consulted read-mostly.
#[derive(Clone)]
pub struct CredentialSigner {
	encoding: EncodingKey,
	decoding: DecodingKey,
	validation: Validation,
	issuer: Arc<str>,
	clock: Arc<dyn Clock>,
	revocations: Arc<RevocationList>,
}
impl CredentialSigner {
	/// Build a signer from configuration.
	pub fn new(
		config: &SigningConfig,
		clock: Arc<dyn Clock>,
		revocations: Arc<RevocationList>,
	) -> Self {
		let secret = config.secret.as_bytes();
		let mut validation = Validation::new(ALGORITHM);

		// Expiry is checked against the injected clock instead.
		validation.validate_exp = false;
		validation.validate_aud = false;
		validation.leeway = 0;
		validation.set_issuer(&[config.issuer.as_str()]);
		validation.set_required_spec_claims(&["exp", "iss", "sub"]);

		Self {
			encoding: EncodingKey::from_secret(secret),
			decoding: DecodingKey::from_secret(secret),
			validation,
			issuer: Arc::from(config.issuer.as_str()),
			clock,
			revocations,
		}
	}

	/// Issuer stamped on every credential.
	pub fn issuer(&self) -> &str {
		&self.issuer
	}

	/// Clock used for expiry arithmetic.
	pub fn clock(&self) -> &Arc<dyn Clock> {
		&self.clock
	}

	/// Mint a credential valid for `ttl` from now.
	pub fn issue<I, S>(
		&self,
		subject: &str,
		scopes: I,
		kind: TokenKind,
		ttl: Duration,
	) -> Result<IssuedCredential>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		if subject.trim().is_empty() {
			return Err(Error::InvalidInput { field: "subject", reason: "Must not be blank.".into() });
		}

		let scopes: BTreeSet<String> = scopes.into_iter().map(Into::into).collect();

		if scopes.iter().any(|scope| scope.trim().is_empty()) {
			return Err(Error::InvalidInput {
				field: "scopes",
				reason: "Scopes must not be blank.".into(),
			});
		}

		let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

		if ttl_secs < 1 {
			return Err(Error::InvalidInput {
				field: "ttl",
				reason: "Must be at least 1 second.".into(),
			});
		}

		let iat = whole_seconds(self.clock.now());
		let exp = TimeDelta::try_seconds(ttl_secs)
			.and_then(|delta| iat.checked_add_signed(delta))
			.ok_or_else(|| Error::InvalidInput {
				field: "ttl",
				reason: "Expiry overflows the representable time range.".into(),
			})?;
		let claims = Claims {
			sub: subject.to_owned(),
			scopes,
			kind,
			iat,
			exp,
			iss: self.issuer.to_string(),
			jti: security::random_jti(),
		};
		let token = jsonwebtoken::encode(&Header::new(ALGORITHM), &claims, &self.encoding)
			.map_err(|err| {
				tracing::error!(error = %err, "credential signing failed");

				Error::Signing(err.to_string())
			})?;

		metrics::record_issued(kind);

		tracing::debug!(
			subject = %claims.sub,
			kind = kind.as_str(),
			jti = %claims.jti,
			expires_at = %claims.exp,
			"credential issued"
		);

		Ok(IssuedCredential { token, claims })
	}

	/// Parse and authenticate a credential of either kind.
	pub async fn verify(&self, token: &str) -> Result<Claims> {
		match self.verify_inner(token).await {
			Ok(claims) => Ok(claims),
			Err(err) => {
				metrics::record_verify_failure(err.code());

				tracing::debug!(
					credential = %security::fingerprint(token),
					code = err.code(),
					"credential rejected"
				);

				Err(err)
			},
		}
	}

	/// Verify and require an access credential.
	pub async fn verify_access(&self, token: &str) -> Result<Claims> {
		let claims = self.verify(token).await?;

		if claims.kind != TokenKind::Access {
			metrics::record_verify_failure("wrong_credential_kind");

			return Err(Error::WrongKind {
				expected: TokenKind::Access.as_str(),
				found: claims.kind.as_str(),
			});
		}

		Ok(claims)
	}

	/// Exchange a refresh credential for a new access credential with the same identity.
	pub async fn refresh(&self, refresh_token: &str, ttl: Duration) -> Result<IssuedCredential> {
		let claims = self.verify(refresh_token).await?;

		if claims.kind != TokenKind::Refresh {
			metrics::record_verify_failure("not_refreshable");

			return Err(Error::NotRefreshable);
		}

		self.issue(&claims.sub, claims.scopes, TokenKind::Access, ttl)
	}

	/// Deny a valid credential for the rest of its lifetime.
	pub async fn revoke(&self, token: &str) -> Result<Claims> {
		let claims = self.verify(token).await?;

		self.revocations.revoke(&claims.jti, claims.exp).await;

		tracing::info!(subject = %claims.sub, jti = %claims.jti, "credential revoked");

		Ok(claims)
	}

	/// Drop revocation entries that outlived their credentials.
	pub async fn purge_revocations(&self) -> usize {
		self.revocations.purge(self.clock.now()).await
	}

	async fn verify_inner(&self, token: &str) -> Result<Claims> {
		let token = token.trim();
		let algorithm = header_algorithm(token)?;

		if algorithm != "HS256" {
			return Err(Error::BadSignature);
		}

		let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
			.map_err(classify)?
			.claims;

		if claims.exp <= claims.iat {
			return Err(Error::Malformed("expiry does not follow issue time".into()));
		}

		let now = self.clock.now();

		if claims.is_expired(now) {
			return Err(Error::Expired { expired_at: claims.exp });
		}
		if self.revocations.is_revoked(&claims.jti, now).await {
			return Err(Error::Revoked);
		}

		Ok(claims)
	}
}
impl Debug for CredentialSigner {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("CredentialSigner")
			.field("algorithm", &ALGORITHM)
			.field("issuer", &self.issuer)
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
	DateTime::<Utc>::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Read the `alg` header without trusting the library to reject unknown algorithms gracefully.
fn header_algorithm(token: &str) -> Result<String> {
	let mut segments = token.split('.');
	let (Some(header), Some(_), Some(_), None) =
		(segments.next(), segments.next(), segments.next(), segments.next())
	else {
		return Err(Error::Malformed("expected three dot-separated segments".into()));
	};
	let raw = BASE64_URL_SAFE_NO_PAD
		.decode(header)
		.map_err(|_| Error::Malformed("header is not base64url".into()))?;
	let header: serde_json::Value = serde_json::from_slice(&raw)
		.map_err(|_| Error::Malformed("header is not JSON".into()))?;

	header
		.get("alg")
		.and_then(serde_json::Value::as_str)
		.map(str::to_owned)
		.ok_or_else(|| Error::Malformed("header carries no algorithm".into()))
}

fn classify(err: jsonwebtoken::errors::Error) -> Error {
	match err.kind() {
		JwtErrorKind::InvalidSignature | JwtErrorKind::InvalidAlgorithm => Error::BadSignature,
		JwtErrorKind::InvalidIssuer => Error::Malformed("issuer is not accepted".into()),
		JwtErrorKind::MissingRequiredClaim(claim) =>
			Error::Malformed(format!("missing required claim '{claim}'")),
		_ => Error::Malformed(err.to_string()),
	}
}
