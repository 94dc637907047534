use std::sync::Arc;
use std::time::Duration;

use chorus_models::user::{Identity, Role};
use chorus_store::SharedStore;
use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::error::CoreError;
use crate::keys;
use crate::rooms::{Departure, RoomCoordinator};

/// Result of one guest sweep.
#[derive(Debug, Default)]
pub struct GuestSweep {
    pub swept: usize,
    /// Room memberships the expired guests held.
    pub departures: Vec<Departure>,
}

/// Randomised low-privilege identities for credential-less connections.
/// Each guest has a registry entry that expires after the idle period.
#[derive(Clone)]
pub struct GuestRegistry {
    store: Arc<dyn SharedStore>,
    idle: Duration,
}

impl GuestRegistry {
    pub fn new(store: Arc<dyn SharedStore>, idle: Duration) -> Self {
        Self { store, idle }
    }

    pub async fn allocate(&self) -> Result<Identity, CoreError> {
        let simple = Uuid::new_v4().simple().to_string();
        let guest_id = format!("guest_{}", &simple[..8]);
        let display_name = format!("Guest-{:04}", rand::thread_rng().gen_range(0..10_000));

        self.store
            .hash_replace(
                &keys::guest(&guest_id),
                vec![
                    ("display_name".into(), display_name.clone()),
                    ("created_at".into(), Utc::now().to_rfc3339()),
                ],
                Some(self.idle),
            )
            .await?;
        self.store.set_add(keys::GUEST_INDEX, &guest_id).await?;
        tracing::info!(guest_id, display_name, "guest identity allocated");
        Ok(Identity::new(guest_id, display_name, Role::Guest))
    }

    /// Push back the guest's idle expiry. Returns false if already expired.
    pub async fn touch(&self, guest_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.expire(&keys::guest(guest_id), self.idle).await?)
    }

    pub async fn is_active(&self, guest_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.exists(&keys::guest(guest_id)).await?)
    }

    /// Drop expired guests from the index and from every room they were in.
    pub async fn sweep(&self, rooms: &RoomCoordinator) -> Result<GuestSweep, CoreError> {
        let mut sweep = GuestSweep::default();
        for guest_id in self.store.set_members(keys::GUEST_INDEX).await? {
            if self.is_active(&guest_id).await? {
                continue;
            }
            let left = rooms.remove_member_everywhere(&guest_id).await?;
            self.store.set_remove(keys::GUEST_INDEX, &guest_id).await?;
            tracing::debug!(guest_id, rooms = left.len(), "expired guest swept");
            sweep.swept += 1;
            sweep.departures.extend(left);
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_models::room::RoomConfig;
    use chorus_store::MemoryStore;

    #[tokio::test]
    async fn guest_identities_are_shaped_and_unique() {
        let guests = GuestRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let a = guests.allocate().await.unwrap();
        let b = guests.allocate().await.unwrap();
        assert!(a.user_id.starts_with("guest_"));
        assert_eq!(a.user_id.len(), "guest_".len() + 8);
        assert!(a.display_name.starts_with("Guest-"));
        assert_eq!(a.role, Role::Guest);
        assert_ne!(a.user_id, b.user_id);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_guests_are_swept_from_rooms() {
        let store = Arc::new(MemoryStore::new());
        let guests = GuestRegistry::new(store.clone(), Duration::from_secs(60));
        let rooms = RoomCoordinator::new(store.clone(), 1);
        rooms
            .create_room("lobby", RoomConfig::public("Lobby", 10), "system")
            .await
            .unwrap();

        let idle = guests.allocate().await.unwrap();
        let busy = guests.allocate().await.unwrap();
        rooms.join_room("lobby", &idle.user_id, &idle.display_name, None).await.unwrap();
        rooms.join_room("lobby", &busy.user_id, &busy.display_name, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(guests.touch(&busy.user_id).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;

        let sweep = guests.sweep(&rooms).await.unwrap();
        assert_eq!(sweep.swept, 1);
        assert_eq!(
            sweep.departures,
            vec![Departure {
                room_id: "lobby".into(),
                user_id: idle.user_id.clone(),
                display_name: idle.display_name.clone(),
            }]
        );
        assert!(!rooms.is_member("lobby", &idle.user_id).await.unwrap());
        assert!(rooms.is_member("lobby", &busy.user_id).await.unwrap());
        assert!(!guests.touch(&idle.user_id).await.unwrap());
    }
}
