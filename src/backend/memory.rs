// Memory type selection

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Find the first memory type allowed by `type_filter` whose property flags
/// contain `required`. Device order is the driver's preference order, so the
/// first hit wins.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let allowed = type_filter & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RenderError::NoCompatibleMemoryType {
            type_filter,
            required,
        })
}

/// Build a memory properties table from a list of property flags.
pub fn memory_properties_from(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: types.len().min(vk::MAX_MEMORY_TYPES) as u32,
        memory_heap_count: 1,
        ..Default::default()
    };
    for (slot, flags) in properties.memory_types.iter_mut().zip(types) {
        *slot = vk::MemoryType {
            property_flags: *flags,
            heap_index: 0,
        };
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    fn typical() -> vk::PhysicalDeviceMemoryProperties {
        memory_properties_from(&[
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
        ])
    }

    #[test]
    fn picks_first_match_in_device_order() {
        let props = typical();
        assert_eq!(find_memory_type(&props, 0b111, DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(
            find_memory_type(&props, 0b111, HOST_VISIBLE | HOST_COHERENT).unwrap(),
            1
        );
    }

    #[test]
    fn respects_type_filter() {
        let props = typical();
        // Type 0 is excluded, so the next device-local type wins
        assert_eq!(find_memory_type(&props, 0b110, DEVICE_LOCAL).unwrap(), 2);
    }

    #[test]
    fn superset_flags_match() {
        let props = memory_properties_from(&[DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT]);
        assert_eq!(find_memory_type(&props, 0b1, HOST_VISIBLE).unwrap(), 0);
    }

    #[test]
    fn no_match_is_a_configuration_error() {
        let props = memory_properties_from(&[DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoCompatibleMemoryType { type_filter: 1, .. }
        ));
    }

    #[test]
    fn empty_filter_never_matches() {
        let props = typical();
        assert!(find_memory_type(&props, 0, vk::MemoryPropertyFlags::empty()).is_err());
    }
}
