//! The username ↔ user-id index.

use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use redb::ReadableTable as _;
use tessera_core::Timestamp;
use tessera_core::id::UserId;
use tracing::debug;

use crate::{
    AccountsDb, AccountsError, AccountsResult, LOG_TARGET, decode, encode, platform_unique,
    users_by_id, users_by_name,
};

#[derive(Debug, Clone, Encode, Decode)]
pub struct UserRecord {
    pub user_id: String,
    pub created: f64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct UsernameRecord {
    pub username: String,
}

fn parse_user_id(raw: &str) -> AccountsResult<UserId> {
    raw.parse().map_err(|_| {
        crate::RecordSnafu {
            table: users_by_name::NAME,
        }
        .build()
    })
}

impl AccountsDb {
    /// Insert a fresh mapping; both sides must be unused.
    pub async fn add_user(&self, username: &str, user_id: &UserId) -> AccountsResult<()> {
        self.write_with(|tx| {
            let mut by_name = tx.open_table(users_by_name::TABLE)?;
            let mut by_id = tx.open_table(users_by_id::TABLE)?;

            if by_name.get(username)?.is_some() {
                return Err(AccountsError::UsernameTaken {
                    username: username.to_owned(),
                });
            }
            if by_id.get(user_id.as_str())?.is_some() {
                return Err(AccountsError::UserIdTaken {
                    user_id: user_id.clone(),
                });
            }

            let record = UserRecord {
                user_id: user_id.to_string(),
                created: Timestamp::now().as_secs(),
            };
            by_name.insert(username, encode(&record).as_slice())?;
            let reverse = UsernameRecord {
                username: username.to_owned(),
            };
            by_id.insert(user_id.as_str(), encode(&reverse).as_slice())?;
            Ok(())
        })
        .await?;

        self.cache_invalidate(username);
        debug!(target: LOG_TARGET, %username, %user_id, "Indexed user");
        Ok(())
    }

    pub async fn get_user_id(&self, username: &str) -> AccountsResult<Option<UserId>> {
        if let Some(cached) = self.cache_get(username) {
            return Ok(Some(cached));
        }
        let found = self
            .read_with(|tx| {
                let by_name = tx.open_table(users_by_name::TABLE)?;
                let Some(guard) = by_name.get(username)? else {
                    return Ok(None);
                };
                let record: UserRecord = decode(users_by_name::NAME, guard.value())?;
                parse_user_id(&record.user_id).map(Some)
            })
            .await?;
        if let Some(user_id) = &found {
            self.cache_insert(username, user_id);
        }
        Ok(found)
    }

    pub async fn get_username(&self, user_id: &UserId) -> AccountsResult<Option<String>> {
        self.read_with(|tx| {
            let by_id = tx.open_table(users_by_id::TABLE)?;
            let Some(guard) = by_id.get(user_id.as_str())? else {
                return Ok(None);
            };
            let record: UsernameRecord = decode(users_by_id::NAME, guard.value())?;
            Ok(Some(record.username))
        })
        .await
    }

    /// Remove the mapping (both directions) for a user id.
    pub async fn delete_user_by_id(&self, user_id: &UserId) -> AccountsResult<Option<String>> {
        let removed = self
            .write_with(|tx| {
                let mut by_name = tx.open_table(users_by_name::TABLE)?;
                let mut by_id = tx.open_table(users_by_id::TABLE)?;

                let Some(guard) = by_id.remove(user_id.as_str())? else {
                    return Ok(None);
                };
                let record: UsernameRecord = decode(users_by_id::NAME, guard.value())?;
                drop(guard);
                by_name.remove(record.username.as_str())?;
                Ok(Some(record.username))
            })
            .await?;

        if let Some(username) = &removed {
            self.cache_invalidate(username);
        }
        Ok(removed)
    }

    /// Full index snapshot, ordered by username.
    pub async fn all_by_username(&self) -> AccountsResult<BTreeMap<String, UserId>> {
        self.read_with(|tx| {
            let by_name = tx.open_table(users_by_name::TABLE)?;
            let mut out = BTreeMap::new();
            for entry in by_name.range::<&str>(..)? {
                let (key, value) = entry?;
                let record: UserRecord = decode(users_by_name::NAME, value.value())?;
                out.insert(key.value().to_owned(), parse_user_id(&record.user_id)?);
            }
            Ok(out)
        })
        .await
    }

    /// Wipe the whole index. Test fixtures only.
    pub async fn delete_all_users(&self) -> AccountsResult<()> {
        self.write_with(|tx| {
            let mut by_name = tx.open_table(users_by_name::TABLE)?;
            let mut by_id = tx.open_table(users_by_id::TABLE)?;
            // collect first: redb iterators borrow the table
            let names: Vec<String> = by_name
                .range::<&str>(..)?
                .map(|entry| entry.map(|(k, _)| k.value().to_owned()))
                .collect::<Result<_, _>>()?;
            for name in names {
                by_name.remove(name.as_str())?;
            }
            let ids: Vec<String> = by_id
                .range::<&str>(..)?
                .map(|entry| entry.map(|(k, _)| k.value().to_owned()))
                .collect::<Result<_, _>>()?;
            for id in ids {
                by_id.remove(id.as_str())?;
            }
            Ok(())
        })
        .await?;
        self.cache_clear();
        Ok(())
    }

    // --- local uniqueness index (standalone mode) ------------------------

    fn unique_key(field: &str, value: &str) -> String {
        format!("{field}\n{value}")
    }

    /// Claim `field=value` for a user. Returns the current owner when taken.
    pub async fn claim_unique(
        &self,
        field: &str,
        value: &str,
        user_id: &UserId,
    ) -> AccountsResult<Result<(), UserId>> {
        let key = Self::unique_key(field, value);
        self.write_with(|tx| {
            let mut table = tx.open_table(platform_unique::TABLE)?;
            if let Some(guard) = table.get(key.as_str())? {
                let record: UserRecord = decode(platform_unique::NAME, guard.value())?;
                let owner = parse_user_id(&record.user_id)?;
                if owner != *user_id {
                    return Ok(Err(owner));
                }
                drop(guard);
            }
            let record = UserRecord {
                user_id: user_id.to_string(),
                created: Timestamp::now().as_secs(),
            };
            table.insert(key.as_str(), encode(&record).as_slice())?;
            Ok(Ok(()))
        })
        .await
    }

    /// Current owner of `field=value`, if any.
    pub async fn lookup_unique(&self, field: &str, value: &str) -> AccountsResult<Option<UserId>> {
        let key = Self::unique_key(field, value);
        self.read_with(|tx| {
            let table = tx.open_table(platform_unique::TABLE)?;
            let Some(guard) = table.get(key.as_str())? else {
                return Ok(None);
            };
            let record: UserRecord = decode(platform_unique::NAME, guard.value())?;
            parse_user_id(&record.user_id).map(Some)
        })
        .await
    }

    pub async fn release_unique(&self, field: &str, value: &str) -> AccountsResult<()> {
        let key = Self::unique_key(field, value);
        self.write_with(|tx| {
            let mut table = tx.open_table(platform_unique::TABLE)?;
            table.remove(key.as_str())?;
            Ok(())
        })
        .await
    }

    /// Release every uniqueness claim held by a user (user deletion).
    pub async fn release_unique_for(&self, user_id: &UserId) -> AccountsResult<usize> {
        self.write_with(|tx| {
            let mut table = tx.open_table(platform_unique::TABLE)?;
            let keys: Vec<String> = table
                .range::<&str>(..)?
                .filter_map(|entry| {
                    entry
                        .map(|(k, v)| {
                            decode::<UserRecord>(platform_unique::NAME, v.value())
                                .ok()
                                .filter(|record| record.user_id == user_id.as_str())
                                .map(|_| k.value().to_owned())
                        })
                        .transpose()
                })
                .collect::<Result<_, _>>()?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
            Ok(keys.len())
        })
        .await
    }
}
