//! GATT client snippet
//!
//! A connection is keyed by the callback id given to `bleConnectGatt`. Every
//! GATT callback for that connection lands on the id's event queue. Reads,
//! writes and service discovery only start the operation; the outcome is
//! delivered as the matching event.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{Listener, ListenerHandle, Retention};
use crate::poll::{self, CONNECTION_TIMEOUT};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::uuid::parse_uuid;
use crate::{Address, Bundle, BundleValue, Error, Result, SnippetContext};

pub const EVENT_CONNECTION_STATE_CHANGE: &str = "onConnectionStateChange";
pub const EVENT_SERVICES_DISCOVERED: &str = "onServicesDiscovered";
pub const EVENT_CHARACTERISTIC_READ: &str = "onCharacteristicRead";
pub const EVENT_CHARACTERISTIC_WRITE: &str = "onCharacteristicWrite";
pub const EVENT_CHARACTERISTIC_CHANGED: &str = "onCharacteristicChanged";

pub const GATT_SUCCESS: i64 = 0;
/// The catch-all status the platform reports for failed connections
pub const GATT_ERROR: i64 = 133;

pub const STATE_DISCONNECTED: i64 = 0;
pub const STATE_CONNECTING: i64 = 1;
pub const STATE_CONNECTED: i64 = 2;

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl Default for WriteType {
    fn default() -> Self {
        WriteType::WithResponse
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn to_bundle(&self) -> Bundle {
        let characteristics: Vec<Bundle> =
            self.characteristics
                .iter()
                .map(|c| {
                    Bundle::new().with("uuid", c.uuid.to_string())
                                 .with("properties", c.properties.bits())
                })
                .collect();
        Bundle::new().with("uuid", self.uuid.to_string())
                     .with("characteristics", characteristics)
    }
}

/// The payload of an [`EVENT_SERVICES_DISCOVERED`] event
pub fn services_discovered_data(status: i64, services: &[GattService]) -> Bundle {
    let services: Vec<Bundle> = services.iter().map(GattService::to_bundle).collect();
    Bundle::new().with("status", status).with("services", BundleValue::BundleList(services))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GattConnectionId(pub u64);

/// A GATT client as exposed by the platform
///
/// Operations return `false` when the platform refuses to start them (for
/// example while another operation is still outstanding). Their results are
/// delivered to the listener given to `connect_gatt`.
pub trait GattPlatform: Send + Sync {
    fn connect_gatt(&self, address: &Address, auto_connect: bool, callback: Arc<dyn Listener>)
                    -> Result<GattConnectionId>;
    fn discover_services(&self, connection: GattConnectionId) -> bool;
    fn read_characteristic(&self, connection: GattConnectionId, service: Uuid,
                           characteristic: Uuid)
                           -> bool;
    fn write_characteristic(&self, connection: GattConnectionId, service: Uuid,
                            characteristic: Uuid, value: &[u8], write_type: WriteType)
                            -> bool;
    fn set_characteristic_notification(&self, connection: GattConnectionId, service: Uuid,
                                       characteristic: Uuid, enable: bool)
                                       -> bool;
    fn disconnect(&self, connection: GattConnectionId);
    fn close(&self, connection: GattConnectionId);
}

#[derive(Debug)]
struct GattConnection {
    id: GattConnectionId,
    address: Address,
    // Last reported connection state and status, updated from the platform's
    // callback thread.
    state: Arc<AtomicI64>,
    status: Arc<AtomicI64>,
}

impl GattConnection {
    fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }
}

pub struct GattClientSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn GattPlatform>,
    connections: DashMap<String, Arc<GattConnection>>,
}

impl GattClientSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().gatt.clone(),
               connections: DashMap::new() }
    }

    /// Connects to `address` and waits until the link is up
    pub async fn connect(&self, callback_id: &str, address: &Address, auto_connect: bool)
                         -> Result<()> {
        let state = Arc::new(AtomicI64::new(STATE_CONNECTING));
        let status = Arc::new(AtomicI64::new(GATT_SUCCESS));
        let mut connection_id = None;

        let platform = self.platform.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let tracker: Arc<dyn Listener> = {
                                 let state = state.clone();
                                 let status = status.clone();
                                 Arc::new(move |name: &str, data: Bundle| {
                                     if name == EVENT_CONNECTION_STATE_CHANGE {
                                         if let Some(s) = data.get_int("status") {
                                             status.store(s, Ordering::SeqCst);
                                         }
                                         if let Some(s) = data.get_int("newState") {
                                             state.store(s, Ordering::SeqCst);
                                         }
                                     }
                                     sink.emit(name, data);
                                 })
                             };
                             let id = platform.connect_gatt(address, auto_connect, tracker)?;
                             connection_id = Some(id);
                             Ok(ListenerHandle::new(move || {
                                 platform.disconnect(id);
                                 platform.close(id);
                             }))
                         })?;
        // Only unset if the factory failed, and then register already bailed
        let id = connection_id.ok_or_else(|| Error::platform_refused("BluetoothDevice.connectGatt"))?;

        let waited = poll::wait_for(&format!("GATT connection to {}", address),
                                    || {
                                        let s = status.load(Ordering::SeqCst);
                                        if s != GATT_SUCCESS {
                                            return Err(Error::platform_code("BluetoothGatt.connect",
                                                                            s as i32));
                                        }
                                        Ok(state.load(Ordering::SeqCst) == STATE_CONNECTED)
                                    },
                                    CONNECTION_TIMEOUT).await;
        if let Err(err) = waited {
            warn!("GATT connection to {} failed: {}", address, err);
            self.ctx.bridge().unregister(callback_id);
            return Err(err);
        }

        self.connections.insert(callback_id.to_string(),
                                Arc::new(GattConnection { id,
                                                          address: address.clone(),
                                                          state,
                                                          status }));
        info!("GATT connected to {} as {}", address, callback_id);
        Ok(())
    }

    fn connection(&self, callback_id: &str) -> Result<Arc<GattConnection>> {
        let connection =
            self.connections
                .get(callback_id)
                .map(|c| c.clone())
                .ok_or_else(|| Error::precondition(format!("No GATT connection {:?}", callback_id)))?;
        if !connection.is_connected() {
            return Err(Error::precondition(format!("GATT connection {:?} to {} is not connected",
                                                   callback_id, connection.address)));
        }
        Ok(connection)
    }

    pub fn discover_services(&self, callback_id: &str) -> Result<()> {
        let connection = self.connection(callback_id)?;
        if !self.platform.discover_services(connection.id) {
            return Err(Error::platform_refused("BluetoothGatt.discoverServices"));
        }
        Ok(())
    }

    pub fn read_characteristic(&self, callback_id: &str, service: Uuid, characteristic: Uuid)
                               -> Result<()> {
        let connection = self.connection(callback_id)?;
        if !self.platform.read_characteristic(connection.id, service, characteristic) {
            return Err(Error::platform_refused("BluetoothGatt.readCharacteristic"));
        }
        Ok(())
    }

    pub fn write_characteristic(&self, callback_id: &str, service: Uuid, characteristic: Uuid,
                                value: &[u8], write_type: WriteType)
                                -> Result<()> {
        let connection = self.connection(callback_id)?;
        if !self.platform.write_characteristic(connection.id,
                                               service,
                                               characteristic,
                                               value,
                                               write_type)
        {
            return Err(Error::platform_refused("BluetoothGatt.writeCharacteristic"));
        }
        Ok(())
    }

    pub fn set_notification(&self, callback_id: &str, service: Uuid, characteristic: Uuid,
                            enable: bool)
                            -> Result<()> {
        let connection = self.connection(callback_id)?;
        if !self.platform
                .set_characteristic_notification(connection.id, service, characteristic, enable)
        {
            return Err(Error::platform_refused("BluetoothGatt.setCharacteristicNotification"));
        }
        Ok(())
    }

    /// Disconnects and closes the connection. Events already delivered for
    /// the callback id stay queued.
    pub async fn disconnect(&self, callback_id: &str) -> Result<()> {
        let (_, connection) =
            self.connections
                .remove(callback_id)
                .ok_or_else(|| Error::precondition(format!("No GATT connection {:?}", callback_id)))?;
        if connection.is_connected() {
            self.platform.disconnect(connection.id);
            let state = connection.state.clone();
            let waited = poll::wait_for("GATT disconnection",
                                        || Ok(state.load(Ordering::SeqCst) == STATE_DISCONNECTED),
                                        CONNECTION_TIMEOUT).await;
            if let Err(err) = waited {
                warn!("Closing {} without a clean disconnect: {}", connection.address, err);
            }
        }
        self.ctx.bridge().unregister(callback_id);
        debug!("GATT connection {} closed", callback_id);
        Ok(())
    }
}

#[async_trait]
impl Snippet for GattClientSnippet {
    fn name(&self) -> &'static str {
        "gatt_client"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "bleConnectGatt" => {
                let callback_id: String = args.get(0)?;
                let address: Address = args.get(1)?;
                let auto_connect: bool = args.get_opt(2)?.unwrap_or(false);
                to_value(self.connect(&callback_id, &address, auto_connect).await?)
            }
            "bleDiscoverServices" => to_value(self.discover_services(&args.get::<String>(0)?)?),
            "bleReadCharacteristic" => {
                let callback_id: String = args.get(0)?;
                let service = parse_uuid(&args.get::<String>(1)?)?;
                let characteristic = parse_uuid(&args.get::<String>(2)?)?;
                to_value(self.read_characteristic(&callback_id, service, characteristic)?)
            }
            "bleWriteCharacteristic" => {
                let callback_id: String = args.get(0)?;
                let service = parse_uuid(&args.get::<String>(1)?)?;
                let characteristic = parse_uuid(&args.get::<String>(2)?)?;
                let value: Vec<u8> = args.get(3)?;
                let write_type: WriteType = args.get_opt(4)?.unwrap_or_default();
                to_value(self.write_characteristic(&callback_id,
                                                   service,
                                                   characteristic,
                                                   &value,
                                                   write_type)?)
            }
            "bleEnableNotification" => {
                let callback_id: String = args.get(0)?;
                let service = parse_uuid(&args.get::<String>(1)?)?;
                let characteristic = parse_uuid(&args.get::<String>(2)?)?;
                let enable: bool = args.get_opt(3)?.unwrap_or(true);
                to_value(self.set_notification(&callback_id, service, characteristic, enable)?)
            }
            "bleDisconnect" => to_value(self.disconnect(&args.get::<String>(0)?).await?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.connections.clear();
        // Releasing the registrations disconnects and closes every client
        self.ctx.bridge().unregister_owned(self.name());
    }
}
