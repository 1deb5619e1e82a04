use zbus::{Result, proxy, zvariant::OwnedFd};

#[proxy(
    default_service = "com.canonical.slotd",
    interface = "com.canonical.slotd.control",
    default_path = "/com/canonical/slotd/control"
)]
pub trait Control {
    async fn open_session(&self, device: u64) -> Result<u64>;
    async fn close_session(&self, session: u64) -> Result<Vec<u32>>;
    async fn get_register_info(&self, session: u64) -> Result<(u32, Vec<u64>)>;
    async fn interrupt_enable(&self, session: u64) -> Result<()>;
    async fn interrupt_disable(&self, session: u64) -> Result<()>;
    async fn get_buffer_pointers(
        &self,
        session: u64,
    ) -> Result<(u64, u64, u64, u64, u64, u64, u64, u64)>;
    async fn get_driver_version(&self) -> Result<(u16, u16, u16, u16)>;
    async fn get_slot_config(&self, session: u64) -> Result<(u32, u32)>;
    async fn acquire_slot(&self, session: u64) -> Result<u32>;
    async fn release_slot(&self, session: u64, slot: u32) -> Result<()>;
    async fn acquire_slot_range(
        &self,
        session: u64,
        range_type: u32,
        start: u32,
        end: u32,
    ) -> Result<()>;
    async fn release_slot_range(&self, session: u64) -> Result<Vec<u32>>;
    async fn get_slot_event(&self, session: u64, slot: u32) -> Result<()>;
    async fn wait_slot_event(
        &self,
        session: u64,
        slot: u32,
        timeout_ms: u32,
        wait: bool,
    ) -> Result<()>;
    async fn reset_slot_event(&self, session: u64, slot: u32) -> Result<()>;
    async fn complete_slot_event(&self, session: u64, slot: u32) -> Result<()>;
    async fn map_region(&self, session: u64, offset: u64, size: u64)
    -> Result<(OwnedFd, u64, u64, bool)>;
}
