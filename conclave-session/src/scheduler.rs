use std::{collections::HashMap, collections::HashSet, sync::Arc};

use chrono::{Duration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use conclave_core::{room_subject, ChannelClass, SchedulerLock};

use crate::{RoomError, RoomManager, SessionContext, SystemEvent};

/// Lock name for the duration enforcement loop
pub const DURATION_WORK: &str = "roomDurationChecker";
/// Lock name for the provider reconciliation loop
pub const RECONCILE_WORK: &str = "activeRoomChecker";

/// How close to its budget a room gets before clients are warned, in seconds
const ENDING_WARNING_WINDOW_SECONDS: i64 = 60;

/// Runs the two periodic maintenance jobs, each guarded by a cluster-wide
/// scheduler lock so only one node executes it per tick.
///
/// Both jobs are idempotent per room, which is what makes the ttl-based
/// locking without fencing tokens acceptable.
#[derive(Clone)]
pub struct Scheduler {
    context: SessionContext,
    rooms: RoomManager,
    lock: SchedulerLock,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    held: Arc<Mutex<HashSet<&'static str>>>,
}

impl Scheduler {
    pub fn new(context: &SessionContext, rooms: &RoomManager) -> Self {
        Self {
            context: context.clone(),
            rooms: rooms.clone(),
            lock: SchedulerLock::new(context.coordination.clone()),
            tasks: Default::default(),
            held: Default::default(),
        }
    }

    /// Starts both periodic loops
    pub fn start(&self) {
        let duration_loop = {
            let scheduler = self.clone();

            tokio::spawn(async move {
                let mut ticks =
                    tokio::time::interval(scheduler.context.config.duration_check_interval());
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    ticks.tick().await;

                    if scheduler.acquire(DURATION_WORK).await {
                        if let Err(e) = scheduler.check_room_durations().await {
                            warn!("Duration check failed: {e}");
                        }

                        scheduler.release(DURATION_WORK).await;
                    }
                }
            })
        };

        let reconcile_loop = {
            let scheduler = self.clone();

            tokio::spawn(async move {
                let mut ticks =
                    tokio::time::interval(scheduler.context.config.reconcile_interval());
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    ticks.tick().await;

                    if scheduler.acquire(RECONCILE_WORK).await {
                        if let Err(e) = scheduler.reconcile().await {
                            warn!("Reconciliation scan failed: {e}");
                        }

                        scheduler.release(RECONCILE_WORK).await;
                    }
                }
            })
        };

        self.tasks.lock().extend([duration_loop, reconcile_loop]);
    }

    /// Stops the loops and releases any lock this node still holds
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let held: Vec<_> = self.held.lock().drain().collect();
        for work in held {
            if let Err(e) = self.lock.release(work).await {
                warn!("Failed to release {work} lock on shutdown: {e}");
            }
        }
    }

    /// Takes the named lock unless another node already runs this job.
    /// A refusal skips the whole tick.
    async fn acquire(&self, work: &'static str) -> bool {
        let taken = async {
            if self.lock.exists(work).await? {
                return Ok(false);
            }

            self.lock
                .acquire(work, self.context.config.scheduler_lock_ttl())
                .await
        }
        .await;

        match taken {
            Ok(true) => {
                self.held.lock().insert(work);
                true
            }
            Ok(false) => false,
            Err(e) => {
                // Fail closed, assume another node has it
                warn!("Could not acquire {work} lock: {e}");
                false
            }
        }
    }

    async fn release(&self, work: &'static str) {
        self.held.lock().remove(work);

        if let Err(e) = self.lock.release(work).await {
            warn!("Failed to release {work} lock: {e}");
        }
    }

    /// Scans presence for rooms past their duration budget and fires an end
    /// call for each. The reconciliation scan completes the records once the
    /// provider reflects the teardown.
    pub async fn check_room_durations(&self) -> Result<(), RoomError> {
        let now = Utc::now();

        for room in self.context.presence.list_rooms().await? {
            let Some(duration) = room.metadata.duration_minutes else {
                continue;
            };

            let expires_at = room.created_at + Duration::minutes(duration as i64);

            if now >= expires_at {
                info!("Room {} exceeded its duration budget, ending it", room.id);

                let provider = self.context.provider.clone();
                let room_id = room.id.clone();

                // Fire and forget, an error here is retried next tick anyway
                tokio::spawn(async move {
                    if let Err(e) = provider.end_session(&room_id).await {
                        warn!("Failed to end expired room {room_id}: {e}");
                    }
                });
            } else if expires_at - now <= Duration::seconds(ENDING_WARNING_WINDOW_SECONDS) {
                let event = SystemEvent::RoomEnding {
                    room_id: room.id.clone(),
                    remaining_seconds: (expires_at - now).num_seconds().max(0) as u64,
                };

                let payload = serde_json::to_vec(&event).expect("system event serializes");
                let subject = room_subject(&room.id, ChannelClass::SystemPublic);

                if let Err(e) = self.context.bus.publish(&subject, payload).await {
                    warn!("Failed to warn room {} about its ending: {e}", room.id);
                }
            }
        }

        Ok(())
    }

    /// Cross-checks every running relational row against the provider's live
    /// room list, healing whatever drifted.
    pub async fn reconcile(&self) -> Result<(), RoomError> {
        let live = self.context.provider.list_sessions().await?;
        let by_room_id: HashMap<&str, _> =
            live.iter().map(|room| (room.room_id.as_str(), room)).collect();

        let stale_before = Utc::now() - self.context.config.stale_room_threshold();

        for row in self.context.database.list_running_rooms().await? {
            let Some(live_room) = by_room_id.get(row.room_id.as_str()) else {
                // A missed room_finished, heal the record ourselves
                info!(
                    "Room {} is gone at the provider, closing its record",
                    row.room_id
                );

                if let Err(e) = self.rooms.finalize(&row).await {
                    warn!("Failed to close record for room {}: {e}", row.room_id);
                }

                continue;
            };

            if live_room.participant_count as i32 != row.participant_count {
                info!(
                    "Correcting participant count for room {} ({} -> {})",
                    row.room_id, row.participant_count, live_room.participant_count
                );

                self.context
                    .database
                    .update_participant_count(&row.sid, live_room.participant_count as i32)
                    .await?;
            }

            if live_room.participant_count == 0 && live_room.created_at < stale_before {
                info!("Force-ending stale empty room {}", row.room_id);

                if let Err(e) = self.rooms.end_room(&row.room_id).await {
                    warn!("Failed to force-end room {}: {e}", row.room_id);
                }
            }
        }

        Ok(())
    }
}
