use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{AttributionStore, Inserted, MirrorStore, RateStore, StoreError};
use crate::{
    chain::{EngagementId, TxRef},
    contracts::{ContractMirrorRecord, MirrorPatch, MirrorStatus},
    identity::{Address, Timestamp},
    ledger::{Attribution, CommissionRule},
    rate_limit::TalentCommissionRate,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attributions (
    id                 TEXT NOT NULL,
    client             TEXT NOT NULL,
    talent             TEXT NOT NULL,
    scout              TEXT NOT NULL,
    locked_fee_percent INTEGER NOT NULL,
    commission_rule    TEXT NOT NULL,
    captured_at        INTEGER NOT NULL,
    expires_at         INTEGER NOT NULL,
    UNIQUE (client, talent, scout)
);
CREATE INDEX IF NOT EXISTS idx_attributions_pair ON attributions (client, talent);
CREATE TABLE IF NOT EXISTS talent_rates (
    talent             TEXT PRIMARY KEY,
    current_percent    INTEGER NOT NULL,
    last_changed_at    INTEGER,
    account_created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS contract_mirror (
    engagement_id     INTEGER PRIMARY KEY,
    client            TEXT NOT NULL,
    talent            TEXT NOT NULL,
    scout             TEXT,
    scout_fee_percent INTEGER,
    amount            INTEGER NOT NULL,
    create_tx_ref     TEXT NOT NULL,
    fund_tx_ref       TEXT,
    status            TEXT NOT NULL,
    recorded_at       INTEGER NOT NULL
);
";

const ATTRIBUTION_COLUMNS: &str =
    "id, client, talent, scout, locked_fee_percent, commission_rule, captured_at, expires_at";
const MIRROR_COLUMNS: &str = "engagement_id, client, talent, scout, scout_fee_percent, amount, \
     create_tx_ref, fund_tx_ref, status, recorded_at";

/// SQLite-backed store. Uniqueness and conditional updates are enforced by
/// the database, not by the lock around the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn int(column: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

fn unsigned(table: &'static str, column: &str, raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("negative {column}: {raw}"),
    })
}

fn address(table: &'static str, raw: String) -> Result<Address, StoreError> {
    Address::parse(&raw).map_err(|err| StoreError::Corrupt {
        table,
        detail: format!("{raw}: {err}"),
    })
}

fn percent(table: &'static str, raw: i64) -> Result<u8, StoreError> {
    u8::try_from(raw).map_err(|_| StoreError::Corrupt {
        table,
        detail: format!("percent out of range: {raw}"),
    })
}

struct AttributionRow {
    id: String,
    client: String,
    talent: String,
    scout: String,
    locked_fee_percent: i64,
    commission_rule: String,
    captured_at: i64,
    expires_at: i64,
}

impl AttributionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client: row.get(1)?,
            talent: row.get(2)?,
            scout: row.get(3)?,
            locked_fee_percent: row.get(4)?,
            commission_rule: row.get(5)?,
            captured_at: row.get(6)?,
            expires_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Attribution, StoreError> {
        const TABLE: &str = "attributions";
        let commission_rule =
            CommissionRule::parse(&self.commission_rule).ok_or_else(|| StoreError::Corrupt {
                table: TABLE,
                detail: format!("unknown commission rule {}", self.commission_rule),
            })?;
        Ok(Attribution {
            id: self.id,
            client: address(TABLE, self.client)?,
            talent: address(TABLE, self.talent)?,
            scout: address(TABLE, self.scout)?,
            locked_fee_percent: percent(TABLE, self.locked_fee_percent)?,
            commission_rule,
            captured_at: unsigned(TABLE, "captured_at", self.captured_at)?,
            expires_at: unsigned(TABLE, "expires_at", self.expires_at)?,
        })
    }
}

struct MirrorRow {
    engagement_id: i64,
    client: String,
    talent: String,
    scout: Option<String>,
    scout_fee_percent: Option<i64>,
    amount: i64,
    create_tx_ref: String,
    fund_tx_ref: Option<String>,
    status: String,
    recorded_at: i64,
}

impl MirrorRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            engagement_id: row.get(0)?,
            client: row.get(1)?,
            talent: row.get(2)?,
            scout: row.get(3)?,
            scout_fee_percent: row.get(4)?,
            amount: row.get(5)?,
            create_tx_ref: row.get(6)?,
            fund_tx_ref: row.get(7)?,
            status: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<ContractMirrorRecord, StoreError> {
        const TABLE: &str = "contract_mirror";
        let status = MirrorStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            table: TABLE,
            detail: format!("unknown status {}", self.status),
        })?;
        Ok(ContractMirrorRecord {
            engagement_id: unsigned(TABLE, "engagement_id", self.engagement_id)?,
            client: address(TABLE, self.client)?,
            talent: address(TABLE, self.talent)?,
            scout: self.scout.map(|s| address(TABLE, s)).transpose()?,
            scout_fee_percent: self
                .scout_fee_percent
                .map(|p| percent(TABLE, p))
                .transpose()?,
            amount: unsigned(TABLE, "amount", self.amount)?,
            create_tx_ref: TxRef(self.create_tx_ref),
            fund_tx_ref: self.fund_tx_ref.map(TxRef),
            status,
            recorded_at: unsigned(TABLE, "recorded_at", self.recorded_at)?,
        })
    }
}

fn select_mirror(
    conn: &Connection,
    engagement_id: EngagementId,
) -> Result<Option<ContractMirrorRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {MIRROR_COLUMNS} FROM contract_mirror WHERE engagement_id = ?1"),
        params![int("engagement_id", engagement_id)?],
        MirrorRow::read,
    )
    .optional()?
    .map(MirrorRow::decode)
    .transpose()
}

fn select_attribution(
    conn: &Connection,
    client: &Address,
    talent: &Address,
    scout: &Address,
) -> Result<Option<Attribution>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {ATTRIBUTION_COLUMNS} FROM attributions \
             WHERE client = ?1 AND talent = ?2 AND scout = ?3"
        ),
        params![client.as_str(), talent.as_str(), scout.as_str()],
        AttributionRow::read,
    )
    .optional()?
    .map(AttributionRow::decode)
    .transpose()
}

fn select_rate(
    conn: &Connection,
    talent: &Address,
) -> Result<Option<TalentCommissionRate>, StoreError> {
    let row = conn
        .query_row(
            "SELECT current_percent, last_changed_at, account_created_at \
             FROM talent_rates WHERE talent = ?1",
            params![talent.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(current, last_changed, created)| {
        const TABLE: &str = "talent_rates";
        Ok(TalentCommissionRate {
            talent: talent.clone(),
            current_percent: percent(TABLE, current)?,
            last_changed_at: last_changed
                .map(|t| unsigned(TABLE, "last_changed_at", t))
                .transpose()?,
            account_created_at: unsigned(TABLE, "account_created_at", created)?,
        })
    })
    .transpose()
}

impl AttributionStore for SqliteStore {
    fn insert_attribution(
        &self,
        attribution: &Attribution,
    ) -> Result<Inserted<Attribution>, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO attributions ({ATTRIBUTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                attribution.id,
                attribution.client.as_str(),
                attribution.talent.as_str(),
                attribution.scout.as_str(),
                attribution.locked_fee_percent,
                attribution.commission_rule.as_str(),
                int("captured_at", attribution.captured_at)?,
                int("expires_at", attribution.expires_at)?,
            ],
        );
        match inserted {
            Ok(_) => Ok(Inserted::New(attribution.clone())),
            Err(err) if is_unique_violation(&err) => {
                select_attribution(&conn, &attribution.client, &attribution.talent, &attribution.scout)?
                    .map(Inserted::Existing)
                    .ok_or_else(|| StoreError::Corrupt {
                        table: "attributions",
                        detail: format!("constraint hit but no row for {}", attribution.id),
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn find_attribution(
        &self,
        client: &Address,
        talent: &Address,
        scout: &Address,
    ) -> Result<Option<Attribution>, StoreError> {
        select_attribution(&*self.conn()?, client, talent, scout)
    }

    fn attributions_for(
        &self,
        client: &Address,
        talent: &Address,
    ) -> Result<Vec<Attribution>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTRIBUTION_COLUMNS} FROM attributions \
             WHERE client = ?1 AND talent = ?2 ORDER BY captured_at, id"
        ))?;
        let rows = stmt
            .query_map(params![client.as_str(), talent.as_str()], AttributionRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AttributionRow::decode).collect()
    }
}

impl RateStore for SqliteStore {
    fn register_talent(
        &self,
        rate: &TalentCommissionRate,
    ) -> Result<TalentCommissionRate, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO talent_rates (talent, current_percent, last_changed_at, account_created_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT (talent) DO NOTHING",
            params![
                rate.talent.as_str(),
                rate.current_percent,
                rate.last_changed_at
                    .map(|t| int("last_changed_at", t))
                    .transpose()?,
                int("account_created_at", rate.account_created_at)?,
            ],
        )?;
        select_rate(&conn, &rate.talent)?.ok_or_else(|| StoreError::Corrupt {
            table: "talent_rates",
            detail: format!("row for {} vanished after insert", rate.talent),
        })
    }

    fn commission_rate(
        &self,
        talent: &Address,
    ) -> Result<Option<TalentCommissionRate>, StoreError> {
        select_rate(&*self.conn()?, talent)
    }

    fn update_commission_rate(
        &self,
        talent: &Address,
        expected_percent: u8,
        expected_last_changed: Option<Timestamp>,
        new_percent: u8,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE talent_rates SET current_percent = ?1, last_changed_at = ?2 \
             WHERE talent = ?3 AND current_percent = ?4 AND last_changed_at IS ?5",
            params![
                new_percent,
                int("last_changed_at", now)?,
                talent.as_str(),
                expected_percent,
                expected_last_changed
                    .map(|t| int("last_changed_at", t))
                    .transpose()?,
            ],
        )?;
        Ok(changed == 1)
    }
}

impl MirrorStore for SqliteStore {
    fn insert_mirror(
        &self,
        record: &ContractMirrorRecord,
    ) -> Result<Inserted<ContractMirrorRecord>, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO contract_mirror ({MIRROR_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                int("engagement_id", record.engagement_id)?,
                record.client.as_str(),
                record.talent.as_str(),
                record.scout.as_ref().map(Address::as_str),
                record.scout_fee_percent,
                int("amount", record.amount)?,
                record.create_tx_ref.as_str(),
                record.fund_tx_ref.as_ref().map(TxRef::as_str),
                record.status.as_str(),
                int("recorded_at", record.recorded_at)?,
            ],
        );
        match inserted {
            Ok(_) => Ok(Inserted::New(record.clone())),
            Err(err) if is_unique_violation(&err) => select_mirror(&conn, record.engagement_id)?
                .map(Inserted::Existing)
                .ok_or_else(|| StoreError::Corrupt {
                    table: "contract_mirror",
                    detail: format!("constraint hit but no row for {}", record.engagement_id),
                }),
            Err(err) => Err(err.into()),
        }
    }

    fn mirror(
        &self,
        engagement_id: EngagementId,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        select_mirror(&*self.conn()?, engagement_id)
    }

    fn patch_mirror(
        &self,
        engagement_id: EngagementId,
        patch: &MirrorPatch,
    ) -> Result<Option<ContractMirrorRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut record) = select_mirror(&tx, engagement_id)? else {
            return Ok(None);
        };
        record.merge(patch);
        tx.execute(
            "UPDATE contract_mirror SET fund_tx_ref = ?1, status = ?2 WHERE engagement_id = ?3",
            params![
                record.fund_tx_ref.as_ref().map(TxRef::as_str),
                record.status.as_str(),
                int("engagement_id", engagement_id)?,
            ],
        )?;
        tx.commit()?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CommissionConfig, identity::DAY_SECS, ledger::AttributionLedger,
        rate_limit::FeeRateLimiter,
    };
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    fn talent_rate(percent: u8) -> TalentCommissionRate {
        TalentCommissionRate {
            talent: Address::parse("0x7a").unwrap(),
            current_percent: percent,
            last_changed_at: None,
            account_created_at: 0,
        }
    }

    #[test]
    fn unique_triple_is_enforced_by_the_table() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.register_talent(&talent_rate(12)).unwrap();
        let ledger = AttributionLedger::new(store.clone(), 30 * DAY_SECS);
        let first = ledger.lock_attribution("0xc1", "0x7a", "0x5c", 10).unwrap();

        let mut rival = first.clone();
        rival.locked_fee_percent = 40;
        match store.insert_attribution(&rival).unwrap() {
            Inserted::Existing(stored) => assert_eq!(stored, first),
            Inserted::New(_) => panic!("duplicate triple accepted"),
        }
        assert_eq!(
            store
                .attributions_for(&first.client, &first.talent)
                .unwrap(),
            vec![first]
        );
    }

    #[test]
    fn racing_locks_agree_on_one_commission() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("race.db")).unwrap());
        store.register_talent(&talent_rate(12)).unwrap();
        let ledger = AttributionLedger::new(store.clone(), 30 * DAY_SECS);
        let talent = Address::parse("0x7a").unwrap();
        let barrier = Barrier::new(9);

        let locked: Vec<Attribution> = thread::scope(|scope| {
            let lockers: Vec<_> = (0..8)
                .map(|i| {
                    let (ledger, barrier) = (&ledger, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        ledger.lock_attribution("0xc1", "0x7a", "0x5c", 10 + i).unwrap()
                    })
                })
                .collect();
            // the advertised rate moves while the locks are in flight
            scope.spawn(|| {
                barrier.wait();
                store.update_commission_rate(&talent, 12, None, 30, 5).unwrap();
            });
            lockers.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let stored = store
            .attributions_for(&locked[0].client, &locked[0].talent)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(matches!(stored[0].locked_fee_percent, 12 | 30));
        for attribution in &locked {
            assert_eq!(attribution, &stored[0]);
        }
    }

    #[test]
    fn values_beyond_the_integer_range_are_refused() {
        let store = SqliteStore::in_memory().unwrap();
        let record = ContractMirrorRecord {
            engagement_id: u64::MAX,
            client: Address::parse("0xc1").unwrap(),
            talent: Address::parse("0x7a").unwrap(),
            scout: None,
            scout_fee_percent: None,
            amount: 1,
            create_tx_ref: TxRef::from("0xcreate"),
            fund_tx_ref: None,
            status: MirrorStatus::Created,
            recorded_at: 9,
        };
        assert!(matches!(
            store.insert_mirror(&record),
            Err(StoreError::OutOfRange { column: "engagement_id", value: u64::MAX })
        ));
        // a clamped id would have collided with this row
        let clamped = ContractMirrorRecord {
            engagement_id: i64::MAX as u64,
            ..record.clone()
        };
        store.insert_mirror(&clamped).unwrap();
        assert!(store.mirror(u64::MAX).is_err());

        let big_amount = ContractMirrorRecord {
            engagement_id: 7,
            amount: u64::MAX,
            ..record
        };
        assert!(matches!(
            store.insert_mirror(&big_amount),
            Err(StoreError::OutOfRange { column: "amount", .. })
        ));
        assert_eq!(store.mirror(7).unwrap(), None);
    }

    #[test]
    fn negative_integers_read_back_as_corrupt() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO talent_rates (talent, current_percent, last_changed_at, account_created_at) \
                 VALUES (?1, 10, NULL, -1)",
                params![Address::parse("0x7a").unwrap().as_str()],
            )
            .unwrap();
        assert!(matches!(
            store.commission_rate(&Address::parse("0x7a").unwrap()),
            Err(StoreError::Corrupt { table: "talent_rates", .. })
        ));
    }

    #[test]
    fn rate_updates_are_conditional() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.register_talent(&talent_rate(12)).unwrap();
        let talent = Address::parse("0x7a").unwrap();
        assert!(store.update_commission_rate(&talent, 12, None, 20, 5).unwrap());
        assert!(!store.update_commission_rate(&talent, 12, None, 25, 6).unwrap());

        let limiter = FeeRateLimiter::new(store.clone(), &CommissionConfig::default());
        let rate = limiter.current_rate(&talent).unwrap();
        assert_eq!((rate.current_percent, rate.last_changed_at), (20, Some(5)));
    }

    #[test]
    fn mirror_round_trip_through_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let record = ContractMirrorRecord {
            engagement_id: 42,
            client: Address::parse("0xc1").unwrap(),
            talent: Address::parse("0x7a").unwrap(),
            scout: None,
            scout_fee_percent: None,
            amount: 5_000,
            create_tx_ref: TxRef::from("0xcreate"),
            fund_tx_ref: None,
            status: MirrorStatus::Created,
            recorded_at: 9,
        };
        assert_eq!(store.insert_mirror(&record).unwrap(), Inserted::New(record.clone()));
        assert_eq!(
            store.insert_mirror(&record).unwrap(),
            Inserted::Existing(record.clone())
        );
        assert_eq!(store.patch_mirror(7, &MirrorPatch::default()).unwrap(), None);

        let patched = store
            .patch_mirror(42, &MirrorPatch::funded(TxRef::from("0xfund")))
            .unwrap()
            .unwrap();
        assert_eq!(store.mirror(42).unwrap(), Some(patched.clone()));
        assert_eq!(patched.amount, 5_000);
        assert_eq!(patched.status, MirrorStatus::Funded);
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.register_talent(&talent_rate(8)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let rate = store
            .commission_rate(&Address::parse("0x7a").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(rate.current_percent, 8);
    }
}
