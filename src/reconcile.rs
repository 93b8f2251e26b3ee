//! Connection tracking
//!
//! Each poll hands us the full list of sessions ka9q-web currently knows about. Comparing it with
//! the connections we consider active tells us which sessions are new, which are still there, and
//! which went away since the last poll.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::{
    geo::{GeoLocation, GeoResolver},
    identity::extract_ip,
    status::Session,
    store::{Observation, SessionKey, Store, StoreError, Writer},
};

/// What one reconciliation did to the connection table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    /// Sessions in the snapshot
    pub seen: usize,
    /// Connections opened
    pub created: usize,
    /// Active connections refreshed
    pub updated: usize,
    /// Connections marked as disconnected
    pub closed: usize,
}

impl Changes {
    /// Whether the table changed other than refreshing existing connections.
    pub fn is_quiet(&self) -> bool {
        self.created == 0 && self.closed == 0
    }
}

impl From<&Session> for Observation {
    fn from(session: &Session) -> Self {
        Observation {
            key: SessionKey {
                client_ip: extract_ip(&session.client).to_owned(),
                ssrc: session.ssrc,
            },
            freq_range: session.freq_range.clone(),
            frequency: session.frequency,
            center_frequency: session.center_frequency,
            bins: session.bins,
            bin_width: session.bin_width,
            audio_active: session.audio_active(),
        }
    }
}

/// Applies snapshots to the connection table.
#[derive(Clone, Debug)]
pub struct Reconciler {
    /// The connection table
    store: Store,
    /// Used to locate clients the first time they show up
    geo: GeoResolver,
}

impl Reconciler {
    pub fn new(store: Store, geo: GeoResolver) -> Self {
        Reconciler { store, geo }
    }

    /// Bring the connection table in line with the sessions of one snapshot taken at `now`.
    #[instrument(name = "reconcile", skip_all)]
    pub async fn reconcile(
        &self,
        sessions: impl IntoIterator<Item = Session>,
        now: DateTime<Utc>,
    ) -> Result<Changes, StoreError> {
        let observations = sessions
            .into_iter()
            .map(|session| Observation::from(&session))
            .collect::<Vec<_>>();

        // Geolocation may hit the network, so it happens before the write transaction is opened.
        // Nothing else writes connections, so the active set can't change in between.
        let active = self.store.active_keys().await?;
        let mut locations = HashMap::<String, GeoLocation>::new();
        for observation in &observations {
            let ip = &observation.key.client_ip;
            if !active.contains(&observation.key) && !locations.contains_key(ip) {
                let location = self.geo.resolve(ip).await?;
                locations.insert(ip.clone(), location);
            }
        }

        self.store
            .write(move |writer| apply(writer, &observations, &locations, now))
            .await
    }
}

/// Apply one snapshot inside a write transaction.
///
/// Opens and refreshes first, then closes whatever was active before and isn't in the snapshot,
/// so a session can never be closed by the same snapshot that contains it.
fn apply(
    writer: &Writer<'_>,
    observations: &[Observation],
    locations: &HashMap<String, GeoLocation>,
    now: DateTime<Utc>,
) -> Result<Changes, StoreError> {
    let previously_active = writer.active()?;
    let mut seen = HashSet::with_capacity(observations.len());
    let mut changes = Changes {
        seen: observations.len(),
        ..Changes::default()
    };

    for observation in observations {
        let key = &observation.key;
        seen.insert(key.clone());

        if let Some(id) = writer.find_active(key)? {
            writer.refresh(id, observation, now)?;
            changes.updated += 1;
        } else {
            let location = locations.get(&key.client_ip).cloned().unwrap_or_default();
            writer.insert(observation, &location, now)?;
            changes.created += 1;
            info!(
                ip = %key.client_ip,
                ssrc = key.ssrc,
                city = ?location.city,
                country = ?location.country,
                "New connection"
            );
        }
    }

    for (id, key) in previously_active {
        if !seen.contains(&key) {
            writer.close(id, now)?;
            changes.closed += 1;
            info!(ip = %key.client_ip, ssrc = key.ssrc, "Connection closed");
        }
    }

    Ok(changes)
}
