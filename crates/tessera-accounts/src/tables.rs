//! Table definitions.
//!
//! All tables key by string (username, user id or token) and store
//! bincode-encoded records.

macro_rules! def_table {
    (
        $(#[$outer:meta])*
        $name:ident : $v:ty
    ) => {
        $(#[$outer])*
        pub(crate) mod $name {
            #[allow(unused)]
            pub type Record = $v;
            pub const NAME: &str = stringify!($name);
            pub const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> =
                redb::TableDefinition::new(NAME);
        }
    };
}

def_table! {
    /// username → [`crate::users::UserRecord`]. The unique owner of a
    /// username on this node.
    users_by_name: crate::users::UserRecord
}

def_table! {
    /// user id → username (reverse index).
    users_by_id: crate::users::UsernameRecord
}

def_table! {
    /// user id → password hash history, newest first, bounded by the
    /// configured rotation depth.
    password_histories: crate::passwords::PasswordHistoryRecord
}

def_table! {
    /// session token → session record. Personal accesses only.
    session_tokens: crate::sessions::SessionRecord
}

def_table! {
    /// `<field>\n<value>` → user id. Local uniqueness index, authoritative
    /// only in standalone mode; in cluster mode the service-register owns
    /// uniqueness.
    platform_unique: crate::users::UserRecord
}

def_table! {
    /// `<user id>\n<access id>` → access record (JSON).
    access_records: ()
}

def_table! {
    /// `<user id>\n<token>` → access id (raw bytes). Hot lookup on every
    /// authenticated request.
    access_tokens: ()
}
