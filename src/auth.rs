//! Password hashing, session tokens and user accounts
//!
//! Passwords are stored as Argon2id PHC strings. Sessions are HS256 JWTs that
//! carry the user's id, username and role and expire after
//! [`SESSION_TTL_HOURS`].

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{ADMIN_ROLE, ADMIN_SEED_ID, ADMIN_USERNAME, SESSION_TTL_HOURS};
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{User, now_millis, time_token};

const SALT_SIZE: usize = 16;

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_string = SaltString::encode_b64(&salt)
        .map_err(|e| AppError::Internal(format!("Salt encoding failed: {}", e)))?;

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for a stored value that is not a PHC hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    pub role: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(SESSION_TTL_HOURS);
        self.sign(&Claims {
            id: user.id.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            exp: exp.timestamp(),
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Token signing failed: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "rejected session token");
                AppError::Unauthorized("Invalid or expired session".to_string())
            })
    }
}

/// The token part of an `Authorization: Bearer <token>` header.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let header = header.ok_or_else(|| AppError::Unauthorized("No token provided".to_string()))?;
    header
        .split(' ')
        .nth(1)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Invalid token format".to_string()))
}

/// Check credentials and open a session.
pub fn login(db: &Database, signer: &TokenSigner, username: &str, password: &str) -> Result<(User, String)> {
    let user = db
        .find_user_by_username(username)?
        .filter(|u| verify_password(password, &u.password_hash))
        .ok_or_else(|| AppError::Unauthorized("Invalid credentials".to_string()))?;

    let token = signer.issue(&user)?;
    tracing::info!(username = %user.username, "user logged in");
    Ok((user, token))
}

/// The user a session header belongs to, read fresh from the store.
pub fn current_user(db: &Database, signer: &TokenSigner, header: Option<&str>) -> Result<User> {
    let token = bearer_token(header)?;
    let claims = signer.verify(token)?;
    db.get_user(&claims.id)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub role: String,
}

pub fn create_user(db: &Database, new_user: &NewUser) -> Result<User> {
    if new_user.username.is_empty() || new_user.password.is_empty() || new_user.role.is_empty() {
        return Err(AppError::BadRequest("Missing fields".to_string()));
    }

    let user = User {
        id: time_token(),
        username: new_user.username.clone(),
        password_hash: hash_password(&new_user.password)?,
        role: new_user.role.clone(),
        created_at: now_millis(),
    };
    db.insert_user(&user)?;
    Ok(user)
}

/// Make sure an `admin` account exists. Returns true when it was created.
pub fn seed_admin(db: &Database, password: &str) -> Result<bool> {
    if db.find_user_by_username(ADMIN_USERNAME)?.is_some() {
        return Ok(false);
    }

    tracing::info!("seeding default admin user");
    db.insert_user(&User {
        id: ADMIN_SEED_ID.to_string(),
        username: ADMIN_USERNAME.to_string(),
        password_hash: hash_password(password)?,
        role: ADMIN_ROLE.to_string(),
        created_at: now_millis(),
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, password: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password: password.to_string(),
            role: "USER".to_string(),
        }
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(!hash.contains("hunter2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "hunter2"));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc.def")).unwrap(), "abc.def");
        assert_eq!(bearer_token(None).unwrap_err().to_string(), "No token provided");
        assert_eq!(
            bearer_token(Some("Bearer")).unwrap_err().to_string(),
            "Invalid token format"
        );
    }

    #[test]
    fn test_token_roundtrip_and_expiry() {
        let signer = TokenSigner::new("secret");
        let user = User {
            id: "u1".to_string(),
            username: "sam".to_string(),
            password_hash: String::new(),
            role: "ADMIN".to_string(),
            created_at: 0,
        };
        let claims = signer.verify(&signer.issue(&user).unwrap()).unwrap();
        assert_eq!(claims.id, "u1");
        assert_eq!(claims.role, "ADMIN");

        let expired = signer
            .sign(&Claims {
                id: "u1".to_string(),
                username: "sam".to_string(),
                role: "ADMIN".to_string(),
                exp: chrono::Utc::now().timestamp() - 3600,
            })
            .unwrap();
        assert!(matches!(signer.verify(&expired), Err(AppError::Unauthorized(_))));

        let other = TokenSigner::new("other-secret");
        assert!(other.verify(&signer.issue(&user).unwrap()).is_err());
    }

    #[test]
    fn test_login_and_session() {
        let db = Database::open_in_memory().unwrap();
        let signer = TokenSigner::new("secret");
        let created = create_user(&db, &new_user("sam", "pw")).unwrap();

        let stored = db.find_user_by_username("sam").unwrap().unwrap();
        assert_ne!(stored.password_hash, "pw");

        let err = login(&db, &signer, "sam", "wrong").unwrap_err();
        assert_eq!(err.to_string(), "Invalid credentials");
        assert!(login(&db, &signer, "nobody", "pw").is_err());

        let (user, token) = login(&db, &signer, "sam", "pw").unwrap();
        assert_eq!(user.id, created.id);

        let header = format!("Bearer {token}");
        let me = current_user(&db, &signer, Some(&header)).unwrap();
        assert_eq!(me.username, "sam");

        db.delete_user(&created.id).unwrap();
        let err = current_user(&db, &signer, Some(&header)).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_create_user_validation() {
        let db = Database::open_in_memory().unwrap();
        let err = create_user(&db, &new_user("", "pw")).unwrap_err();
        assert_eq!(err.to_string(), "Missing fields");

        create_user(&db, &new_user("sam", "pw")).unwrap();
        let err = create_user(&db, &new_user("sam", "other")).unwrap_err();
        assert_eq!(err.to_string(), "Username already exists");
    }

    #[test]
    fn test_seed_admin_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        assert!(seed_admin(&db, "admin").unwrap());
        assert!(!seed_admin(&db, "changed").unwrap());

        let admin = db.get_user("admin-seed").unwrap().unwrap();
        assert_eq!(admin.role, "ADMIN");
        assert!(verify_password("admin", &admin.password_hash));
    }
}
