//! SeaORM entity models used by the storage layer.
//!
//! These structs map to the SQLite tables created by
//! [`Database::ensure_schema`](super::database::Database::ensure_schema):
//! - `clients`: probes known to the master, looked up by name
//! - `config`: plugin-scoped key/value configuration
//! - `flow_filters`: versioned membership changes of named filters
//! - `flows`: materialized directional flow events

/// Known probes.
pub mod clients {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "clients")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        /// Name the probe announces in its hello frame
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Plugin-scoped configuration rows.
pub mod config {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "config")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub plugin: String,
        pub name: String,
        pub value: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// One membership change of a named filter within an epoch.
pub mod flow_filters {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "flow_filters")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        /// Filter name
        pub filter: String,
        pub epoch: i64,
        pub version: i64,
        /// `ip`, `ip:port` or `[ipv6]:port`
        pub address: String,
        /// True when the address joins the filter, false when it leaves
        pub added: bool,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Materialized flow events.
pub mod flows {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "flows")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        /// Foreign key to `clients.id`
        pub client: i32,
        pub ip_from: String,
        pub ip_to: String,
        pub port_from: i32,
        pub port_to: i32,
        /// `T` for TCP, `U` for UDP
        pub proto: String,
        /// RFC3339 timestamps
        pub start: String,
        pub stop: String,
        pub opposite_start: Option<String>,
        pub size: i64,
        pub count: i64,
        pub inbound: bool,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
