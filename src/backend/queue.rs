// Queue roles and queue family assignment
//
// A device exposes a list of queue families. The renderer wants four roles
// (graphics, transfer, present, compute) and prefers a separate family for
// each so they can run in parallel on the hardware. When the device does not
// have enough families, roles fall back to sharing.

use ash::vk;

/// Logical queue role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Transfer,
    Present,
    Compute,
}

impl QueueRole {
    /// Fixed priority order used by the exclusive assignment pass.
    pub const ALL: [QueueRole; 4] = [
        QueueRole::Graphics,
        QueueRole::Transfer,
        QueueRole::Present,
        QueueRole::Compute,
    ];

    pub(crate) fn slot(self) -> usize {
        match self {
            QueueRole::Graphics => 0,
            QueueRole::Transfer => 1,
            QueueRole::Present => 2,
            QueueRole::Compute => 3,
        }
    }
}

/// What one queue family can do, as seen by the assignment algorithm.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyCaps {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub present: bool,
}

impl QueueFamilyCaps {
    pub fn from_properties(properties: &vk::QueueFamilyProperties, present: bool) -> Self {
        Self {
            flags: properties.queue_flags,
            queue_count: properties.queue_count,
            present,
        }
    }

    pub fn supports(&self, role: QueueRole) -> bool {
        if self.queue_count == 0 {
            return false;
        }
        match role {
            QueueRole::Graphics => self.flags.contains(vk::QueueFlags::GRAPHICS),
            // Graphics and compute families implicitly accept transfer commands
            QueueRole::Transfer => self.flags.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ),
            QueueRole::Present => self.present,
            QueueRole::Compute => self.flags.contains(vk::QueueFlags::COMPUTE),
        }
    }
}

/// Role -> queue family index. Roles may alias the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    families: [Option<u32>; 4],
}

impl QueueFamilyIndices {
    pub fn get(&self, role: QueueRole) -> Option<u32> {
        self.families[role.slot()]
    }

    pub fn set(&mut self, role: QueueRole, family: u32) {
        self.families[role.slot()] = Some(family);
    }

    /// Family index for a role, for use after completeness was checked.
    pub fn family(&self, role: QueueRole) -> u32 {
        self.get(role).unwrap_or(vk::QUEUE_FAMILY_IGNORED)
    }

    pub fn graphics(&self) -> u32 {
        self.family(QueueRole::Graphics)
    }

    pub fn transfer(&self) -> u32 {
        self.family(QueueRole::Transfer)
    }

    pub fn present(&self) -> u32 {
        self.family(QueueRole::Present)
    }

    pub fn compute(&self) -> u32 {
        self.family(QueueRole::Compute)
    }

    /// All four roles resolved to some family.
    pub fn is_complete(&self) -> bool {
        self.families.iter().all(Option::is_some)
    }

    /// Unique family indices in role priority order.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(4);
        for family in self.families.iter().flatten() {
            if !unique.contains(family) {
                unique.push(*family);
            }
        }
        unique
    }
}

/// Assign queue families to roles.
///
/// Pass 1 gives every family to at most one role, walking the families in
/// device order and the roles in priority order. A family that can do
/// graphics is taken for graphics and never looked at again in this pass, so
/// transfer and present end up on other families when the device has them.
/// Pass 2 fills whatever is left by letting roles share the first family
/// that supports them.
pub fn assign_queue_families(families: &[QueueFamilyCaps]) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();

    for (i, caps) in families.iter().enumerate() {
        let i = i as u32;
        if let Some(role) = QueueRole::ALL
            .iter()
            .copied()
            .find(|&role| indices.get(role).is_none() && caps.supports(role))
        {
            indices.set(role, i);
        }

        if indices.is_complete() {
            return indices;
        }
    }

    for role in QueueRole::ALL {
        if indices.get(role).is_some() {
            continue;
        }
        let shared = families
            .iter()
            .enumerate()
            .find(|(_, caps)| caps.supports(role))
            .map(|(i, _)| i as u32);
        if let Some(family) = shared {
            log::debug!("Queue role {:?} shares family {}", role, family);
            indices.set(role, family);
        }
    }

    indices
}

/// Resolved queue instances: one (family, index) per role plus the number
/// of queues to request from each family at device creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    pub indices: QueueFamilyIndices,
    assignments: [(u32, u32); 4],
    family_counts: Vec<(u32, u32)>,
}

impl QueuePlan {
    /// Hand out queue instances per family. Roles sharing a family get
    /// distinct queues while the family has them, then share the last one.
    pub fn resolve(indices: QueueFamilyIndices, families: &[QueueFamilyCaps]) -> Option<Self> {
        if !indices.is_complete() {
            return None;
        }

        let mut obtained: Vec<(u32, u32)> = Vec::new();
        let mut assignments = [(0, 0); 4];

        for role in QueueRole::ALL {
            let family = indices.family(role);
            let available = families.get(family as usize)?.queue_count.max(1);

            let counter = match obtained.iter_mut().find(|(f, _)| *f == family) {
                Some((_, count)) => count,
                None => {
                    obtained.push((family, 0));
                    &mut obtained.last_mut()?.1
                }
            };
            let queue_index = (*counter).min(available - 1);
            if *counter < available {
                *counter += 1;
            }
            assignments[role.slot()] = (family, queue_index);
        }

        Some(Self {
            indices,
            assignments,
            family_counts: obtained,
        })
    }

    /// (family, queue index within the family) for a role.
    pub fn queue_for(&self, role: QueueRole) -> (u32, u32) {
        self.assignments[role.slot()]
    }

    /// (family, number of queues) to request at device creation.
    pub fn family_counts(&self) -> &[(u32, u32)] {
        &self.family_counts
    }

    /// True when the family hosts more than one of our roles.
    pub fn is_shared(&self, role: QueueRole) -> bool {
        let family = self.indices.family(role);
        QueueRole::ALL
            .iter()
            .filter(|&&other| self.indices.family(other) == family)
            .count()
            > 1
    }

    pub fn describe(&self) -> String {
        QueueRole::ALL
            .iter()
            .map(|&role| {
                let (family, index) = self.queue_for(role);
                format!("{:?}={}.{}", role, family, index)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count: 1,
            present,
        }
    }

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn exclusive_pass_spreads_roles_over_families() {
        let families = [
            family(G | C | T, true),
            family(T, false),
            family(C | T, true),
            family(C, false),
        ];
        let indices = assign_queue_families(&families);

        assert!(indices.is_complete());
        assert_eq!(indices.graphics(), 0);
        assert_eq!(indices.transfer(), 1);
        assert_eq!(indices.present(), 2);
        assert_eq!(indices.compute(), 3);
        assert_eq!(indices.unique_families().len(), 4);
    }

    #[test]
    fn graphics_family_is_not_reused_for_transfer_in_first_pass() {
        // Family 0 can do everything, family 1 only transfer
        let families = [family(G | C | T, true), family(T, false)];
        let indices = assign_queue_families(&families);

        assert_eq!(indices.graphics(), 0);
        assert_eq!(indices.transfer(), 1);
        // Present and compute had nowhere exclusive to go
        assert_eq!(indices.present(), 0);
        assert_eq!(indices.compute(), 0);
    }

    #[test]
    fn single_universal_family_is_shared_by_all_roles() {
        let families = [family(G | C | T, true)];
        let indices = assign_queue_families(&families);

        assert!(indices.is_complete());
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn present_only_family_wins_present() {
        let families = [family(G | C | T, true), family(vk::QueueFlags::empty(), true)];
        let indices = assign_queue_families(&families);

        assert_eq!(indices.graphics(), 0);
        assert_eq!(indices.present(), 1);
        assert_eq!(indices.transfer(), 0);
    }

    #[test]
    fn missing_present_support_leaves_indices_incomplete() {
        let families = [family(G | C | T, false)];
        let indices = assign_queue_families(&families);

        assert!(!indices.is_complete());
        assert_eq!(indices.get(QueueRole::Present), None);
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            QueueFamilyCaps {
                flags: G | C | T,
                queue_count: 0,
                present: true,
            },
            family(G | C | T, true),
        ];
        let indices = assign_queue_families(&families);
        assert_eq!(indices.graphics(), 1);
    }

    #[test]
    fn plan_hands_out_distinct_queues_when_family_has_them() {
        let families = [QueueFamilyCaps {
            flags: G | C | T,
            queue_count: 2,
            present: true,
        }];
        let indices = assign_queue_families(&families);
        let plan = QueuePlan::resolve(indices, &families).unwrap();

        assert_eq!(plan.queue_for(QueueRole::Graphics), (0, 0));
        assert_eq!(plan.queue_for(QueueRole::Transfer), (0, 1));
        // Out of queues: remaining roles share the last one
        assert_eq!(plan.queue_for(QueueRole::Present), (0, 1));
        assert_eq!(plan.queue_for(QueueRole::Compute), (0, 1));
        assert_eq!(plan.family_counts(), &[(0, 2)]);
        assert!(plan.is_shared(QueueRole::Graphics));
    }

    #[test]
    fn plan_requests_one_queue_per_dedicated_family() {
        let families = [
            QueueFamilyCaps {
                flags: G | C | T,
                queue_count: 2,
                present: true,
            },
            family(T, false),
            family(C, false),
        ];
        let indices = assign_queue_families(&families);
        let plan = QueuePlan::resolve(indices, &families).unwrap();

        // Graphics and present share family 0 but get a queue each
        assert_eq!(plan.family_counts(), &[(0, 2), (1, 1), (2, 1)]);
        assert_eq!(plan.queue_for(QueueRole::Present), (0, 1));
        assert!(!plan.is_shared(QueueRole::Transfer));
    }

    #[test]
    fn plan_requires_complete_indices() {
        let families = [family(G, false)];
        let indices = assign_queue_families(&families);
        assert!(QueuePlan::resolve(indices, &families).is_none());
    }
}
