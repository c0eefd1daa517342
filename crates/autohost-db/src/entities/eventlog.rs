use sea_orm::entity::prelude::*;

/// Append-only moderation audit trail.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "eventlog")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub whensent: DateTimeWithTimeZone,
    pub msg: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
