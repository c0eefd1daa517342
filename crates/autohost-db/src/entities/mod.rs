//! Tables of the externally managed relational store.
//!
//! The schema is owned by the website backend; these definitions only
//! mirror the columns the hoster reads or writes.

pub mod accounts;
pub mod bans;
pub mod eventlog;
pub mod games;
pub mod identities;
pub mod players;
