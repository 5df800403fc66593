use crate::config::settings::PackConfig;
use crate::plc::manager::{ChangeListener, PlcManager};
use crate::publish::batcher::Publisher;
use crate::publish::PackMessage;
use crate::tags::value::ValueChange;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tracing::warn;

struct PackDef {
    name: String,
    /// (plc, tag-or-alias) references as configured.
    members: Vec<(String, String)>,
}

type PackSink = Arc<dyn Fn(&PackMessage) + Send + Sync>;

/// Republishes named tag groups as one JSON object whenever any member
/// changes. Publishers receive the pack through their batch queue; the SSE
/// hub through an injected sink.
pub struct PackRegistry {
    manager: Arc<PlcManager>,
    packs: Vec<PackDef>,
    publishers: StdMutex<Vec<Arc<Publisher>>>,
    extra_sinks: StdMutex<Vec<PackSink>>,
}

impl PackRegistry {
    pub fn new(manager: Arc<PlcManager>, configs: &[PackConfig]) -> Arc<Self> {
        let packs = configs
            .iter()
            .filter_map(|cfg| {
                let mut members = Vec::new();
                for reference in &cfg.tags {
                    match reference.split_once('.') {
                        Some((plc, tag)) if !plc.is_empty() && !tag.is_empty() => {
                            members.push((plc.to_string(), tag.to_string()));
                        }
                        _ => {
                            warn!(pack = %cfg.name, reference = %reference, "bad pack member; expected <plc>.<tag>");
                        }
                    }
                }
                if members.is_empty() {
                    warn!(pack = %cfg.name, "pack has no valid members; dropped");
                    None
                } else {
                    Some(PackDef {
                        name: cfg.name.clone(),
                        members,
                    })
                }
            })
            .collect();
        Arc::new(PackRegistry {
            manager,
            packs,
            publishers: StdMutex::new(Vec::new()),
            extra_sinks: StdMutex::new(Vec::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn add_publisher(&self, publisher: Arc<Publisher>) {
        self.publishers
            .lock()
            .expect("pack publishers lock")
            .push(publisher);
    }

    pub fn add_sink(&self, sink: PackSink) {
        self.extra_sinks
            .lock()
            .expect("pack sinks lock")
            .push(sink);
    }

    fn affected(&self, changes: &[ValueChange]) -> Vec<usize> {
        let mut hit = Vec::new();
        for (i, pack) in self.packs.iter().enumerate() {
            let touched = changes.iter().any(|c| {
                pack.members
                    .iter()
                    .any(|(plc, tag)| *plc == c.plc && (*tag == c.tag || *tag == c.alias))
            });
            if touched {
                hit.push(i);
            }
        }
        hit
    }

    async fn assemble(&self, pack: &PackDef) -> PackMessage {
        let mut tags = BTreeMap::new();
        for (plc_name, tag_ref) in &pack.members {
            let Some(plc) = self.manager.plc(plc_name).await else {
                continue;
            };
            let p = plc.read().await;
            let Some(sel) = p.selection(tag_ref) else {
                continue;
            };
            if let Some(tv) = p.values.get(&sel.name) {
                if tv.error.is_none() {
                    tags.insert(format!("{}.{}", plc_name, sel.alias), tv.value.clone());
                }
            }
        }
        PackMessage {
            pack: pack.name.clone(),
            tags,
            timestamp: crate::publish::now_rfc3339(),
        }
    }
}

#[async_trait]
impl ChangeListener for PackRegistry {
    async fn on_changes(&self, changes: &[ValueChange]) {
        for idx in self.affected(changes) {
            let message = self.assemble(&self.packs[idx]).await;
            if message.tags.is_empty() {
                continue;
            }
            let publishers: Vec<Arc<Publisher>> = self
                .publishers
                .lock()
                .expect("pack publishers lock")
                .clone();
            for publisher in publishers {
                publisher.publish_pack(&message).await;
            }
            let sinks: Vec<PackSink> = self.extra_sinks.lock().expect("pack sinks lock").clone();
            for sink in sinks {
                sink(&message);
            }
        }
    }
}
