use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use tracing::warn;

use super::{LeaseBackend, LeaseOp};
use crate::addr::MacAddr;
use crate::lease::{Lease, LeaseState};
use crate::subnet::{Subnet, SubnetId};

/// One `zc_lease4` row. The transaction time isn't stored; it is recovered
/// from `expire - valid_life_time`, so round-trips hold to second precision.
#[derive(Debug, Clone, PartialEq, FromRow)]
struct LeaseRow {
    address: i64,
    state: i32,
    valid_life_time: i64,
    client_id: String,
    subnet_id: i64,
    expire: DateTime<Utc>,
    host_name: String,
    mac: String,
}

impl LeaseRow {
    fn encode(lease: &Lease) -> Self {
        Self {
            address: u32::from(lease.addr) as i64,
            state: lease.state.as_db(),
            valid_life_time: lease.valid_life_time.as_secs() as i64,
            client_id: hex_encode(&lease.client_id),
            subnet_id: lease.subnet_id as i64,
            expire: lease.expired_at(),
            host_name: lease.host_name.clone(),
            mac: lease.mac.map(|mac| mac.to_string()).unwrap_or_default(),
        }
    }

    fn decode(self) -> Lease {
        let valid_life_time = Duration::from_secs(self.valid_life_time.max(0) as u64);
        Lease {
            addr: Ipv4Addr::from(self.address as u32),
            subnet_id: self.subnet_id as SubnetId,
            state: LeaseState::from_db(self.state),
            mac: self.mac.parse::<MacAddr>().ok(),
            client_id: hex_decode(&self.client_id),
            host_name: self.host_name,
            client_last_trans_time: self.expire
                - chrono::Duration::seconds(valid_life_time.as_secs() as i64),
            valid_life_time,
            renew_time: Duration::ZERO,
            rebind_time: Duration::ZERO,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Vec<u8> {
    if s.len() % 2 != 0 {
        return Vec::new();
    }
    let mut bytes = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        match u8::from_str_radix(&s[i..i + 2], 16) {
            Ok(byte) => bytes.push(byte),
            Err(_) => return Vec::new(),
        }
    }
    bytes
}

/// Durable lease storage in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, op: &LeaseOp) -> Result<(), sqlx::Error> {
        match op {
            LeaseOp::Add(lease) => {
                let row = LeaseRow::encode(lease);
                sqlx::query(
                    "INSERT INTO zc_lease4 \
                     (address, state, valid_life_time, client_id, subnet_id, expire, host_name, mac) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(row.address)
                .bind(row.state)
                .bind(row.valid_life_time)
                .bind(&row.client_id)
                .bind(row.subnet_id)
                .bind(row.expire)
                .bind(&row.host_name)
                .bind(&row.mac)
                .execute(&mut **tx)
                .await?;
            }
            LeaseOp::Update(lease) => {
                let row = LeaseRow::encode(lease);
                sqlx::query(
                    "UPDATE zc_lease4 SET \
                     state = $2, valid_life_time = $3, client_id = $4, subnet_id = $5, \
                     expire = $6, host_name = $7, mac = $8 \
                     WHERE address = $1",
                )
                .bind(row.address)
                .bind(row.state)
                .bind(row.valid_life_time)
                .bind(&row.client_id)
                .bind(row.subnet_id)
                .bind(row.expire)
                .bind(&row.host_name)
                .bind(&row.mac)
                .execute(&mut **tx)
                .await?;
            }
            LeaseOp::Delete { subnet_id, addr } => {
                sqlx::query("DELETE FROM zc_lease4 WHERE address = $1 AND subnet_id = $2")
                    .bind(u32::from(*addr) as i64)
                    .bind(*subnet_id as i64)
                    .execute(&mut **tx)
                    .await?;
            }
            LeaseOp::DeleteSubnet { subnet_id } => {
                sqlx::query("DELETE FROM zc_lease4 WHERE subnet_id = $1")
                    .bind(*subnet_id as i64)
                    .execute(&mut **tx)
                    .await?;
            }
            LeaseOp::DeletePool { subnet_id, start, end } => {
                sqlx::query(
                    "DELETE FROM zc_lease4 \
                     WHERE subnet_id = $1 AND address >= $2 AND address <= $3",
                )
                .bind(*subnet_id as i64)
                .bind(*start as i64)
                .bind(*end as i64)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Standalone single-op form; opens its own transaction.
    pub async fn execute(&self, op: LeaseOp) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        Self::apply(&mut tx, &op).await?;
        tx.commit().await
    }

    pub async fn get_by_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease>, sqlx::Error> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT address, state, valid_life_time, client_id, subnet_id, expire, host_name, mac \
             FROM zc_lease4 WHERE subnet_id = $1",
        )
        .bind(subnet_id as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LeaseRow::decode).collect())
    }

    pub async fn lease_count(&self, subnet_id: SubnetId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM zc_lease4 WHERE subnet_id = $1")
            .bind(subnet_id as i64)
            .fetch_one(&self.pool)
            .await
    }

    /// Startup purge: drops the subnet's rows whose address no longer lies in
    /// any current pool.
    async fn delete_outside_subnet(&self, subnet: &Subnet) -> Result<u64, sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("DELETE FROM zc_lease4 WHERE subnet_id = ");
        builder.push_bind(subnet.id as i64);
        builder.push(" AND NOT (");
        let mut ranges = builder.separated(" OR ");
        for pool in &subnet.pools {
            ranges.push("(address >= ");
            ranges.push_bind_unseparated(pool.start as i64);
            ranges.push_unseparated(" AND address <= ");
            ranges.push_bind_unseparated(pool.end as i64);
            ranges.push_unseparated(")");
        }
        builder.push(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl LeaseBackend for PgLeaseStore {
    async fn commit(&self, batch: Vec<LeaseOp>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in &batch {
            Self::apply(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_subnet(&self, subnet: &Subnet) -> anyhow::Result<Vec<Lease>> {
        if subnet.pools.is_empty() {
            warn!(subnet = subnet.id, "subnet has no pools, purging its leases");
            self.execute(LeaseOp::DeleteSubnet { subnet_id: subnet.id }).await?;
            return Ok(Vec::new());
        }
        let purged = self.delete_outside_subnet(subnet).await?;
        if purged > 0 {
            warn!(subnet = subnet.id, purged, "purged leases outside current pools");
        }
        Ok(self.get_by_subnet(subnet.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn row_round_trip() {
        let trans_time = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        let lease = Lease {
            addr: Ipv4Addr::new(10, 20, 30, 40),
            subnet_id: 7,
            state: LeaseState::Declined,
            mac: Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
            client_id: vec![0x01, 0x3c, 0x0c],
            host_name: "edge-relay".into(),
            client_last_trans_time: trans_time,
            valid_life_time: Duration::from_secs(3600),
            renew_time: Duration::ZERO,
            rebind_time: Duration::ZERO,
        };

        let row = LeaseRow::encode(&lease);
        assert_eq!(row.address, u32::from(lease.addr) as i64);
        assert_eq!(row.state, 1);
        assert_eq!(row.client_id, "013c0c");
        assert_eq!(row.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(row.expire, trans_time + chrono::Duration::seconds(3600));

        assert_eq!(row.decode(), lease);
    }

    #[test]
    fn decode_tolerates_empty_owner() {
        let row = LeaseRow {
            address: u32::from(Ipv4Addr::new(10, 0, 0, 1)) as i64,
            state: 1,
            valid_life_time: 60,
            client_id: String::new(),
            subnet_id: 3,
            expire: Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap(),
            host_name: String::new(),
            mac: String::new(),
        };
        let lease = row.decode();
        assert_eq!(lease.state, LeaseState::Declined);
        assert_eq!(lease.mac, None);
        assert!(lease.client_id.is_empty());
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x3c]), "00ff3c");
        assert_eq!(hex_decode("00ff3c"), vec![0x00, 0xff, 0x3c]);
        assert_eq!(hex_decode("0"), Vec::<u8>::new());
        assert_eq!(hex_decode("zz"), Vec::<u8>::new());
    }
}
