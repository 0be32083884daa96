//! Embedded DDL text (`spec.md` §6: "migrations are applied in numbered
//! order at startup by an external helper; the core assumes they are
//! present"). This crate defines the SQL, it does not execute it —
//! callers feed `ALL` to whatever migration runner they already use
//! (`sqlx::migrate!`, `refinery`, a shell script), the same division of
//! responsibility the teacher leaves to its own deployment tooling.

/// The one migration this workspace ships: the six `wh_`-prefixed
/// infrastructure tables and their claim indexes.
pub const MIGRATION_0001_INIT: &str = include_str!("../migrations/0001_init.sql");

/// All migrations, in the numbered order they must be applied.
pub const ALL: &[(&str, &str)] = &[("0001_init", MIGRATION_0001_INIT)];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_text_is_not_empty() {
        assert!(!MIGRATION_0001_INIT.trim().is_empty());
    }

    #[test]
    fn all_migrations_are_named_and_ordered() {
        assert_eq!(ALL.len(), 1);
        assert_eq!(ALL[0].0, "0001_init");
    }

    #[test]
    fn init_migration_declares_every_infrastructure_table() {
        for table in [
            "wh_service_instances",
            "wh_message_dedup",
            "wh_active_streams",
            "wh_outbox",
            "wh_inbox",
            "wh_perspective_checkpoints",
        ] {
            assert!(
                MIGRATION_0001_INIT.contains(table),
                "migration text missing table {table}"
            );
        }
    }
}
