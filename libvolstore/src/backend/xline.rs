use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, KeyValue,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use log::debug;

use crate::backend::{KvBackend, KvEntry, RawBatch, RawEvent, RawWatch};
use crate::config::StoreConfig;
use crate::error::StoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// [`KvBackend`] over the etcd v3 API (etcd or xline).
#[derive(Clone)]
pub struct XlineBackend {
    client: Client,
}

impl XlineBackend {
    /// Connects and checks the cluster once; the etcd client connects lazily,
    /// so without that check an unreachable cluster would only surface later.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let opts = ConnectOptions::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_timeout(REQUEST_TIMEOUT);
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.with_user(user.clone(), pass.clone())
        } else {
            opts
        };

        let mut client = Client::connect(config.endpoints.clone(), Some(opts)).await?;
        client
            .get(
                config.prefix.as_str(),
                Some(GetOptions::new().with_keys_only().with_limit(1)),
            )
            .await?;
        Ok(Self { client })
    }

    fn cli(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl KvBackend for XlineBackend {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let resp = self.cli().get(key, None).await?;
        resp.kvs().first().map(kv_to_entry).transpose()
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, i64), StoreError> {
        let resp = self
            .cli()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let entries = resp
            .kvs()
            .iter()
            .map(kv_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((entries, revision))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.cli().put(key, value, None).await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.cli().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let resp = self
            .cli()
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await?;
        resp.prev_kvs().first().map(kv_to_entry).transpose()
    }

    async fn claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cli = self.cli();
        let lease = cli.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        let lease_id = lease.id();
        let put = || TxnOp::put(key, holder, Some(PutOptions::new().with_lease(lease_id)));

        let free = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([put()]);
        let renew = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, holder)])
            .and_then([put()]);

        let claimed = match cli.txn(free).await {
            Ok(resp) if resp.succeeded() => true,
            Ok(_) => match cli.txn(renew).await {
                Ok(resp) => resp.succeeded(),
                Err(e) => {
                    let _ = cli.lease_revoke(lease_id).await;
                    return Err(e.into());
                }
            },
            Err(e) => {
                let _ = cli.lease_revoke(lease_id).await;
                return Err(e.into());
            }
        };

        if !claimed {
            debug!("claim on {key} held by another holder");
            let _ = cli.lease_revoke(lease_id).await;
        }
        Ok(claimed)
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<RawWatch, StoreError> {
        let mut opts = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            opts = opts.with_start_revision(start_revision);
        }
        let (watcher, stream) = self.cli().watch(prefix, Some(opts)).await?;

        let batches = stream.map(move |resp| {
            // the watch is canceled once its watcher is dropped
            let _watcher = &watcher;
            let resp = resp?;
            if resp.compact_revision() > 0 {
                return Err(StoreError::Compacted(resp.compact_revision()));
            }
            if resp.canceled() {
                return Err(StoreError::Canceled(resp.cancel_reason().to_string()));
            }
            let mut events = Vec::with_capacity(resp.events().len());
            for ev in resp.events() {
                let Some(kv) = ev.kv() else { continue };
                match ev.event_type() {
                    EventType::Put => events.push(RawEvent::Put(kv_to_entry(kv)?)),
                    EventType::Delete => events.push(RawEvent::Delete {
                        key: std::str::from_utf8(kv.key())?.to_string(),
                        mod_revision: kv.mod_revision(),
                    }),
                }
            }
            Ok(RawBatch { events })
        });
        Ok(batches.boxed())
    }
}

fn kv_to_entry(kv: &KeyValue) -> Result<KvEntry, StoreError> {
    Ok(KvEntry {
        key: std::str::from_utf8(kv.key())?.to_string(),
        value: kv.value().to_vec(),
        version: kv.version(),
        mod_revision: kv.mod_revision(),
    })
}
