//! Member/Team models and a seeded storage for this crate's unit tests.

use asupersync::Outcome;
use persist_core::{
    AUDIT_FIELDS, AuditFields, EntityRegistry, Error, FieldInfo, Lazy, LazyMany, Model, ModelRef,
    RelationshipInfo, Result, Row, SqlType, Value, adopt_row,
};
use persist_memory::MemoryStorage;
use std::sync::Arc;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub members: LazyMany<Member>,
}

impl Team {
    pub fn new(id: Option<i64>, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            members: match id {
                Some(id) => LazyMany::new("team_id", id),
                None => LazyMany::transient("team_id"),
            },
        }
    }
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

    fn assign_generated_key(&mut self, key: &Value) {
        self.id = key.as_i64();
    }

    fn attach_joined(
        &self,
        relationship: &str,
        rows: &[Row],
        registry: &mut dyn EntityRegistry,
    ) -> Result<()> {
        match relationship {
            "members" => {
                let members = rows
                    .iter()
                    .map(|row| adopt_row::<Member>(registry, row))
                    .collect::<Result<Vec<_>>>()?;
                self.members.resolve_with(members);
                Ok(())
            }
            other => Err(Error::invalid_descriptor("team", format!("unknown association '{other}'"))),
        }
    }
}

#[derive(Debug)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Lazy<Team>,
    pub audit: AuditFields,
}

impl Member {
    pub fn new(id: Option<i64>, username: &str, age: i32, team: Option<&ModelRef<Team>>) -> Self {
        Self {
            id,
            username: username.to_string(),
            age,
            team: team.map_or_else(Lazy::empty, Lazy::to),
            audit: AuditFields::default(),
        }
    }
}

static MEMBER_FIELDS: [FieldInfo; 8] = [
    FieldInfo::new("id", "member_id", SqlType::BigInt)
        .primary_key(true)
        .auto_increment(true),
    FieldInfo::new("username", "username", SqlType::Text),
    FieldInfo::new("age", "age", SqlType::Integer),
    FieldInfo::new("team", "team_id", SqlType::BigInt)
        .nullable(true)
        .foreign_key("team.team_id"),
    AUDIT_FIELDS[0],
    AUDIT_FIELDS[1],
    AUDIT_FIELDS[2],
    AUDIT_FIELDS[3],
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
        let mut row = vec![
            ("member_id", self.id.into()),
            ("username", self.username.clone().into()),
            ("age", self.age.into()),
            ("team_id", self.team.fk_value()),
        ];
        row.extend(self.audit.to_row());
        row
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Member {
            id: row.get_named("member_id")?,
            username: row.get_named("username")?,
            age: row.get_named("age")?,
            team: Lazy::from_fk(row.get_by_name("team_id").cloned().unwrap_or(Value::Null)),
            audit: AuditFields::from_row(row)?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn assign_generated_key(&mut self, key: &Value) {
        self.id = key.as_i64();
    }

    fn audit_fields_mut(&mut self) -> Option<&mut AuditFields> {
        Some(&mut self.audit)
    }

    fn attach_joined(
        &self,
        relationship: &str,
        rows: &[Row],
        registry: &mut dyn EntityRegistry,
    ) -> Result<()> {
        match relationship {
            "team" => {
                if let Some(row) = rows.first() {
                    self.team.resolve_with(adopt_row::<Team>(registry, row)?);
                }
                Ok(())
            }
            other => Err(Error::invalid_descriptor("member", format!("unknown association '{other}'"))),
        }
    }
}

/// teamA(1): member1 (10), member2 (20); teamB(2): member3 (30), member4 (40).
pub fn seeded_storage() -> Arc<MemoryStorage> {
    let storage = MemoryStorage::new();
    storage.create_table("team", &["team_id"], true);
    storage.create_table("member", &["member_id"], true);
    storage
        .seed(
            "team",
            [(1, "teamA"), (2, "teamB")].map(|(id, name)| {
                Row::from_pairs([("team_id", Value::BigInt(id)), ("name", Value::from(name))])
            }),
        )
        .unwrap();
    storage
        .seed(
            "member",
            [(1, "member1", 10, 1), (2, "member2", 20, 1), (3, "member3", 30, 2), (4, "member4", 40, 2)]
                .map(|(id, name, age, team): (i64, &str, i32, i64)| {
                    Row::from_pairs([
                        ("member_id", Value::BigInt(id)),
                        ("username", Value::from(name)),
                        ("age", Value::Int(age)),
                        ("team_id", Value::BigInt(team)),
                    ])
                }),
        )
        .unwrap();
    Arc::new(storage)
}
