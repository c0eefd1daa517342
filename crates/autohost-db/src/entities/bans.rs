use sea_orm::entity::prelude::*;

/// A ban row targets an identity, an account, or both.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "bans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub identity: Option<i64>,
    pub account: Option<i64>,
    pub time_issued: DateTimeWithTimeZone,
    pub time_expires: Option<DateTimeWithTimeZone>,
    pub reason: String,
    pub forbids_joining: bool,
    pub forbids_playing: bool,
    pub forbids_chatting: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
