use std::collections::BTreeMap;

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};

use crate::error_handling::types::DbError;
use crate::storage::db_entities::{config, flow_filters};
use crate::storage::Database;

/// Plugin-scoped configuration, key to value.
pub type ConfigSnapshot = BTreeMap<String, String>;

/// Per filter name, the newest epoch and the newest version within it.
pub type FilterVersions = BTreeMap<String, (u32, u32)>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub config: ConfigSnapshot,
    pub filters: FilterVersions,
}

/// One membership change of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRecord {
    pub address: String,
    pub version: u32,
    pub added: bool,
}

fn as_u32(what: &str, value: i64) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::BadRow(format!("{what} {value} out of range")))
}

/// Reads the configuration of `plugin` and the current version of every
/// filter in a single transaction.
pub fn load_snapshot(db: &mut Database, plugin: &str) -> Result<Snapshot, DbError> {
    db.transaction(true, |cursor| {
        let rows = cursor.block_on(
            config::Entity::find()
                .filter(config::Column::Plugin.eq(plugin))
                .all(cursor.connection()),
        )?;
        let config = rows.into_iter().map(|row| (row.name, row.value)).collect();

        let mut filters = FilterVersions::new();
        let versions = cursor.query_all(
            "SELECT filter, epoch, MAX(version) AS version
             FROM flow_filters GROUP BY filter, epoch",
            vec![],
        )?;
        for row in versions {
            let name: String = row.try_get("", "filter")?;
            let epoch = as_u32("epoch", row.try_get("", "epoch")?)?;
            let version = as_u32("version", row.try_get("", "version")?)?;
            let newest = filters.entry(name).or_insert((epoch, version));
            if epoch > newest.0 {
                *newest = (epoch, version);
            }
        }

        Ok(Snapshot { config, filters })
    })
}

/// Changes of filter `name` in `epoch` with a version in `(from, to]`,
/// oldest first.
pub fn load_history(
    db: &mut Database,
    name: &str,
    epoch: u32,
    from: u32,
    to: u32,
) -> Result<Vec<FilterRecord>, DbError> {
    db.transaction(true, |cursor| {
        let rows = cursor.block_on(
            flow_filters::Entity::find()
                .filter(flow_filters::Column::Filter.eq(name))
                .filter(flow_filters::Column::Epoch.eq(i64::from(epoch)))
                .filter(flow_filters::Column::Version.gt(i64::from(from)))
                .filter(flow_filters::Column::Version.lte(i64::from(to)))
                .order_by_asc(flow_filters::Column::Version)
                .order_by_asc(flow_filters::Column::Id)
                .all(cursor.connection()),
        )?;
        rows.into_iter()
            .map(|row| {
                Ok(FilterRecord {
                    version: as_u32("version", row.version)?,
                    address: row.address,
                    added: row.added,
                })
            })
            .collect()
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::test_support::temp_db;

    pub fn set_config(db: &mut Database, plugin: &str, name: &str, value: &str) {
        db.transaction(true, |cursor| {
            cursor.execute(
                "INSERT INTO config (plugin, name, value) VALUES (?, ?, ?)
                 ON CONFLICT (plugin, name) DO UPDATE SET value = excluded.value",
                vec![plugin.into(), name.into(), value.into()],
            )
        })
        .unwrap();
    }

    pub fn add_change(db: &mut Database, filter: &str, epoch: u32, version: u32, address: &str, added: bool) {
        db.transaction(true, |cursor| {
            cursor.execute(
                "INSERT INTO flow_filters (filter, epoch, version, address, added)
                 VALUES (?, ?, ?, ?, ?)",
                vec![
                    filter.into(),
                    i64::from(epoch).into(),
                    i64::from(version).into(),
                    address.into(),
                    added.into(),
                ],
            )
        })
        .unwrap();
    }

    #[test]
    fn test_snapshot_reads_plugin_config() {
        let (_dir, mut db) = temp_db();
        set_config(&mut db, "flow", "version", "3");
        set_config(&mut db, "flow", "filter", "T");
        set_config(&mut db, "other", "version", "9");

        let snapshot = load_snapshot(&mut db, "flow").unwrap();
        assert_eq!(snapshot.config.len(), 2);
        assert_eq!(snapshot.config["version"], "3");
        assert!(snapshot.filters.is_empty());
    }

    #[test]
    fn test_snapshot_takes_newest_epoch() {
        let (_dir, mut db) = temp_db();
        add_change(&mut db, "f", 1, 10, "10.0.0.1", true);
        add_change(&mut db, "f", 2, 3, "10.0.0.1", true);
        add_change(&mut db, "f", 2, 4, "10.0.0.2", true);
        add_change(&mut db, "g", 1, 7, "10.0.0.3", true);

        let snapshot = load_snapshot(&mut db, "flow").unwrap();
        assert_eq!(snapshot.filters["f"], (2, 4));
        assert_eq!(snapshot.filters["g"], (1, 7));
    }

    #[test]
    fn test_history_range() {
        let (_dir, mut db) = temp_db();
        add_change(&mut db, "f", 1, 1, "A", true);
        add_change(&mut db, "f", 1, 3, "A", false);
        add_change(&mut db, "f", 1, 4, "B", true);
        add_change(&mut db, "f", 1, 6, "C", true);
        add_change(&mut db, "f", 2, 2, "D", true);
        add_change(&mut db, "g", 1, 2, "E", true);

        let history = load_history(&mut db, "f", 1, 1, 5).unwrap();
        let addresses: Vec<_> = history.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["A", "B"]);
        assert_eq!(history[0].version, 3);
        assert!(!history[0].added);
    }
}
