//! Member/Team models shared by this crate's unit tests.

use persist_core::{
    FieldInfo, Lazy, LazyMany, Model, RelationshipInfo, Result, Row, SqlType, Value,
};

#[derive(Debug)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub members: LazyMany<Member>,
}

static TEAM_FIELDS: [FieldInfo; 2] = [
    FieldInfo::new("id", "team_id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true),
    FieldInfo::new("name", "name", SqlType::Text),
];

static TEAM_RELATIONSHIPS: [RelationshipInfo; 1] = [RelationshipInfo::one_to_many(
    "members", "member", "team_id", "team_id",
)];

impl Model for Team {
    const TABLE_NAME: &'static str = "team";
    const PRIMARY_KEY: &'static [&'static str] = &["team_id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &TEAM_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &TEAM_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("team_id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let id: Option<i64> = row.get_named("team_id")?;
        Ok(Team {
            id,
            name: row.get_named("name")?,
            members: LazyMany::new("team_id", id),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }
}

#[derive(Debug)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Lazy<Team>,
}

static MEMBER_FIELDS: [FieldInfo; 4] = [
    FieldInfo::new("id", "member_id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true),
    FieldInfo::new("username", "username", SqlType::Text),
    FieldInfo::new("age", "age", SqlType::Integer),
    FieldInfo::new("team", "team_id", SqlType::BigInt)
        .nullable(true)
        .foreign_key("team.team_id"),
];

static MEMBER_RELATIONSHIPS: [RelationshipInfo; 1] = [RelationshipInfo::many_to_one(
    "team", "team", "team_id", "team_id",
)];

impl Model for Member {
    const TABLE_NAME: &'static str = "member";
    const PRIMARY_KEY: &'static [&'static str] = &["member_id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &MEMBER_RELATIONSHIPS;

    fn fields() -> &'static [FieldInfo] {
        &MEMBER_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("member_id", self.id.into()),
            ("username", self.username.clone().into()),
            ("age", self.age.into()),
            ("team_id", self.team.fk_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Member {
            id: row.get_named("member_id")?,
            username: row.get_named("username")?,
            age: row.get_named("age")?,
            team: Lazy::from_fk(row.get_by_name("team_id").cloned().unwrap_or(Value::Null)),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }
}
