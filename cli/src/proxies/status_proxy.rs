use zbus::{Result, proxy};

#[proxy(
    default_service = "com.canonical.slotd",
    interface = "com.canonical.slotd.status",
    default_path = "/com/canonical/slotd/status"
)]
pub trait Status {
    async fn list_devices(&self) -> Result<Vec<(u64, String, String)>>;
    async fn find_device(&self, name: &str) -> Result<u64>;
    async fn get_attribute(&self, device: u64, name: &str) -> Result<String>;
    async fn get_attributes(&self, device: u64) -> Result<Vec<(String, String)>>;
    async fn get_slot_geometry(&self, device: u64) -> Result<(u32, u32, u32)>;
    async fn get_slot_owners(&self, device: u64) -> Result<Vec<(u32, u32)>>;
    async fn get_config(&self) -> Result<String>;
    async fn get_driver_version(&self) -> Result<(u16, u16, u16, u16)>;
}
