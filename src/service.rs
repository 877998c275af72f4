use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::backend::ServiceInfo;
use crate::session::{Link, Session};
use crate::Characteristic;

/// A service discovered on the current connection generation.
#[derive(Debug, Clone)]
pub struct Service {
    uuid: Uuid,
    characteristics: Vec<Characteristic>,
}

impl Service {
    pub(crate) fn new(link: Weak<Link>, info: ServiceInfo) -> Self {
        let uuid = info.uuid;
        Self {
            uuid,
            characteristics: info
                .characteristics
                .into_iter()
                .map(|characteristic| Characteristic::new(link.clone(), uuid, characteristic))
                .collect(),
        }
    }

    /// A copy whose characteristics hold `session` alive.
    pub(crate) fn bound(&self, session: &Arc<Session>) -> Self {
        Self {
            uuid: self.uuid,
            characteristics: self
                .characteristics
                .iter()
                .map(|characteristic| characteristic.bound(session))
                .collect(),
        }
    }

    /// Characteristics in discovery order
    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.characteristics.clone()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid() == uuid)
            .cloned()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}
