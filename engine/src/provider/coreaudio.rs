#![cfg(target_os = "macos")]

//! [`HalProvider`] over the CoreAudio `AudioObject*` C API.
//!
//! Text properties (`lnam`, `lmak`, `uid `) are `CFStringRef` on the HAL
//! side. They are converted to NUL-terminated UTF-8 here so the codec only
//! ever sees plain bytes.

use super::{HalProvider, ListenerFn, ListenerToken, ProviderError};
use crate::address::{DeviceId, PropertyAddress, Scope, fourcc};
use crate::error::{NO_ERROR, UNSUPPORTED_OPERATION, os_status};
use crate::mutex::lock;
use crate::selector::{self, Shape};

use coreaudio_sys::{
    AudioObjectAddPropertyListener, AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize,
    AudioObjectHasProperty, AudioObjectID, AudioObjectIsPropertySettable,
    AudioObjectPropertyAddress, AudioObjectRemovePropertyListener, AudioObjectSetPropertyData,
    Boolean, CFIndex, CFRelease, CFStringGetCString, CFStringGetLength,
    CFStringGetMaximumSizeForEncoding, CFStringRef, OSStatus, UInt32,
};
use std::collections::HashMap;
use std::ffi::CStr;
use std::mem;
use std::os::raw::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

/// `kAudioObjectPropertyClass`, answered by every live object.
const CLASS_ADDRESS: PropertyAddress = PropertyAddress::new(fourcc(b"clas"), Scope::Global);

struct ListenerContext {
    listener: ListenerFn,
}

struct Registration {
    object: AudioObjectID,
    address: AudioObjectPropertyAddress,
    // Boxed so the pointer handed to the HAL stays put.
    context: Box<ListenerContext>,
}

impl Registration {
    fn client_data(&self) -> *mut c_void {
        &*self.context as *const ListenerContext as *mut c_void
    }
}

pub struct CoreAudioProvider {
    registrations: Mutex<HashMap<u64, Registration>>,
    next_token: AtomicU64,
}

impl Default for CoreAudioProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreAudioProvider {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

fn native(address: &PropertyAddress) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: address.selector,
        mScope: address.scope.code(),
        mElement: address.element,
    }
}

fn from_native(address: &AudioObjectPropertyAddress) -> Option<PropertyAddress> {
    let scope = Scope::from_code(address.mScope)?;
    Some(PropertyAddress::new(address.mSelector, scope).with_element(address.mElement))
}

fn is_cf_string(address: &PropertyAddress) -> bool {
    selector::shape_of(address.selector) == Shape::Text
}

fn check(status: OSStatus) -> Result<(), ProviderError> {
    if status == NO_ERROR {
        Ok(())
    } else {
        Err(ProviderError::from_status(status))
    }
}

fn data_size(object: AudioObjectID, address: &PropertyAddress) -> Result<UInt32, OSStatus> {
    let native_address = native(address);
    let mut size: UInt32 = 0;
    let status: OSStatus = unsafe {
        AudioObjectGetPropertyDataSize(object, &native_address, 0, ptr::null(), &mut size)
    };
    if status == NO_ERROR {
        Ok(size)
    } else {
        Err(status)
    }
}

/// Read a CFString property and return it as UTF-8 with a trailing NUL.
fn read_cf_string(
    object: AudioObjectID,
    address: &PropertyAddress,
) -> Result<Vec<u8>, ProviderError> {
    let native_address = native(address);
    let mut cf_string: CFStringRef = ptr::null();
    let mut size: UInt32 = mem::size_of::<CFStringRef>() as UInt32;
    let status: OSStatus = unsafe {
        AudioObjectGetPropertyData(
            object,
            &native_address,
            0,
            ptr::null(),
            &mut size,
            &mut cf_string as *mut CFStringRef as *mut c_void,
        )
    };
    check(status)?;
    if cf_string.is_null() {
        return Ok(vec![0]);
    }

    let capacity: CFIndex = unsafe {
        CFStringGetMaximumSizeForEncoding(CFStringGetLength(cf_string), CF_STRING_ENCODING_UTF8)
    };
    let mut buf = vec![0 as std::os::raw::c_char; capacity.max(0) as usize + 1];
    let ok = unsafe {
        CFStringGetCString(
            cf_string,
            buf.as_mut_ptr(),
            buf.len() as _,
            CF_STRING_ENCODING_UTF8,
        )
    };
    unsafe { CFRelease(cf_string as *const c_void) };
    if ok == 0 {
        return Err(ProviderError::Native(crate::error::BAD_PROPERTY_SIZE));
    }

    let c_str = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(c_str.to_bytes_with_nul().to_vec())
}

unsafe extern "C" fn property_listener(
    object: AudioObjectID,
    count: UInt32,
    addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() {
        return NO_ERROR;
    }
    let context = unsafe { &*(client_data as *const ListenerContext) };
    let changed: Vec<PropertyAddress> = if addresses.is_null() || count == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(addresses, count as usize) }
            .iter()
            .filter_map(from_native)
            .collect()
    };
    // Unwinding into the HAL's thread is undefined behaviour.
    if catch_unwind(AssertUnwindSafe(|| {
        (context.listener)(DeviceId(object), &changed)
    }))
    .is_err()
    {
        tracing::error!("CoreAudio property listener panicked for object {object}");
    }
    NO_ERROR
}

impl CoreAudioProvider {
    /// Map a failed size query to the provider's error classes.
    ///
    /// The HAL does not always answer a missing object with `'!obj'`, so an
    /// address the object lacks is told apart from a dead object by asking
    /// for its class.
    fn classify(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        status: OSStatus,
    ) -> ProviderError {
        match ProviderError::from_status(status) {
            ProviderError::Native(_) if !self.has_property(object, address) => {
                if data_size(object.raw(), &CLASS_ADDRESS).is_ok() {
                    ProviderError::Unsupported
                } else {
                    ProviderError::UnknownObject
                }
            }
            other => other,
        }
    }
}

impl HalProvider for CoreAudioProvider {
    fn has_property(&self, object: DeviceId, address: &PropertyAddress) -> bool {
        let native_address = native(address);
        unsafe { AudioObjectHasProperty(object.raw(), &native_address) != 0 }
    }

    fn query_size(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
    ) -> Result<usize, ProviderError> {
        let size = data_size(object.raw(), address)
            .map_err(|status| self.classify(object, address, status))?;
        if is_cf_string(address) {
            return read_cf_string(object.raw(), address).map(|bytes| bytes.len());
        }
        Ok(size as usize)
    }

    fn read_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError> {
        if is_cf_string(address) {
            let bytes = read_cf_string(object.raw(), address)?;
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            return Ok(n);
        }
        let native_address = native(address);
        let mut size: UInt32 = buf.len() as UInt32;
        let status: OSStatus = unsafe {
            AudioObjectGetPropertyData(
                object.raw(),
                &native_address,
                0,
                ptr::null(),
                &mut size,
                buf.as_mut_ptr() as *mut c_void,
            )
        };
        check(status)?;
        Ok(size as usize)
    }

    fn write_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        data: &[u8],
    ) -> Result<(), ProviderError> {
        if is_cf_string(address) {
            return Err(ProviderError::Native(UNSUPPORTED_OPERATION));
        }
        let native_address = native(address);
        let status: OSStatus = unsafe {
            AudioObjectSetPropertyData(
                object.raw(),
                &native_address,
                0,
                ptr::null(),
                data.len() as UInt32,
                data.as_ptr() as *const c_void,
            )
        };
        check(status)
    }

    fn is_settable(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
    ) -> Result<bool, ProviderError> {
        let native_address = native(address);
        let mut settable: Boolean = 0;
        let status: OSStatus = unsafe {
            AudioObjectIsPropertySettable(object.raw(), &native_address, &mut settable)
        };
        check(status)?;
        Ok(settable != 0)
    }

    fn register_listener(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        listener: ListenerFn,
    ) -> Result<ListenerToken, ProviderError> {
        let registration = Registration {
            object: object.raw(),
            address: native(address),
            context: Box::new(ListenerContext { listener }),
        };
        let status: OSStatus = unsafe {
            AudioObjectAddPropertyListener(
                registration.object,
                &registration.address,
                Some(property_listener),
                registration.client_data(),
            )
        };
        check(status)?;

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&self.registrations).insert(token, registration);
        tracing::debug!("CoreAudio listener {token} added for {address} on object {object}");
        Ok(ListenerToken(token))
    }

    fn deregister_listener(&self, token: ListenerToken) -> Result<(), ProviderError> {
        let registration = lock(&self.registrations)
            .remove(&token.0)
            .ok_or(ProviderError::Native(crate::error::ILLEGAL_OPERATION))?;
        let status: OSStatus = unsafe {
            AudioObjectRemovePropertyListener(
                registration.object,
                &registration.address,
                Some(property_listener),
                registration.client_data(),
            )
        };
        // The context is only released once the HAL no longer references it.
        if status != NO_ERROR {
            tracing::warn!(
                "CoreAudio listener {} removal failed: {}",
                token.0,
                os_status(status)
            );
            mem::forget(registration);
            return Err(ProviderError::from_status(status));
        }
        Ok(())
    }
}

impl Drop for CoreAudioProvider {
    fn drop(&mut self) {
        let tokens: Vec<u64> = lock(&self.registrations).keys().copied().collect();
        for token in tokens {
            let _ = self.deregister_listener(ListenerToken(token));
        }
    }
}
