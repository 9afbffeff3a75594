use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use replay_rs::backend::spec::{BackendError, BackendResult};

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUstream = *mut c_void;
type CUgraph = *mut c_void;
type CUgraphExec = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CU_STREAM_NON_BLOCKING: u32 = 1;
// Other threads may keep issuing unrelated driver calls while this stream records.
const CU_STREAM_CAPTURE_MODE_RELAXED: u32 = 2;
const CU_STREAM_CAPTURE_STATUS_NONE: u32 = 0;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemsetD8AsyncFn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    value: u8,
    count: usize,
    stream: CUstream,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamBeginCaptureV2Fn = unsafe extern "C" fn(stream: CUstream, mode: u32) -> CUresult;
type CuStreamEndCaptureFn = unsafe extern "C" fn(stream: CUstream, graph: *mut CUgraph) -> CUresult;
type CuStreamIsCapturingFn = unsafe extern "C" fn(stream: CUstream, status: *mut u32) -> CUresult;
type CuGraphInstantiateWithFlagsFn =
    unsafe extern "C" fn(exec: *mut CUgraphExec, graph: CUgraph, flags: u64) -> CUresult;
type CuGraphLaunchFn = unsafe extern "C" fn(exec: CUgraphExec, stream: CUstream) -> CUresult;
type CuGraphExecDestroyFn = unsafe extern "C" fn(exec: CUgraphExec) -> CUresult;
type CuGraphDestroyFn = unsafe extern "C" fn(graph: CUgraph) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_memcpy_dto_d_async_v2: CuMemcpyDtoDAsyncV2Fn,
    cu_memset_d8_async: CuMemsetD8AsyncFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_stream_begin_capture_v2: CuStreamBeginCaptureV2Fn,
    cu_stream_end_capture: CuStreamEndCaptureFn,
    cu_stream_is_capturing: CuStreamIsCapturingFn,
    cu_graph_instantiate_with_flags: CuGraphInstantiateWithFlagsFn,
    cu_graph_launch: CuGraphLaunchFn,
    cu_graph_exec_destroy: CuGraphExecDestroyFn,
    cu_graph_destroy: CuGraphDestroyFn,
}

/// Driver entry points, one context and the one stream every operation is issued on.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Handles stored as usize so CudaDriver can satisfy Send/Sync requirements for backend traits.
    ctx: usize,
    stream: usize,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.stream != 0 {
            // SAFETY: Stream is owned by this driver and destroyed once before its context.
            let _ = unsafe { (self.fns.cu_stream_destroy_v2)(self.stream_ptr()) };
            self.stream = 0;
        }
        if self.ctx != 0 {
            // SAFETY: Context is owned by this driver instance and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

/// A device allocation released when dropped.
pub struct DeviceAllocation {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceAllocation {
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        // The dropping thread may have no current context.
        let _ = self.driver.ensure_current();
        // SAFETY: Device pointer was allocated by this driver and is released once on drop.
        let _ = unsafe { (self.driver.fns.cu_mem_free_v2)(self.ptr) };
    }
}

/// An instantiated graph and the graph it was built from.
pub struct GraphExec {
    driver: Arc<CudaDriver>,
    graph: usize,
    exec: usize,
}

impl Drop for GraphExec {
    fn drop(&mut self) {
        let _ = self.driver.ensure_current();
        // SAFETY: Both handles were created by this driver and are destroyed once, exec first.
        unsafe {
            let _ = (self.driver.fns.cu_graph_exec_destroy)(self.exec as CUgraphExec);
            let _ = (self.driver.fns.cu_graph_destroy)(self.graph as CUgraph);
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::execution(format!(
            "CUDA driver unavailable for replay backend: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = open_driver_library()?;
        let fns = DriverFns {
            cu_init: resolve_symbol(&lib, b"cuInit\0")?,
            cu_device_get: resolve_symbol(&lib, b"cuDeviceGet\0")?,
            cu_ctx_create_v2: resolve_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: resolve_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: resolve_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: resolve_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: resolve_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_async_v2: resolve_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: resolve_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_memcpy_dto_d_async_v2: resolve_symbol(&lib, b"cuMemcpyDtoDAsync_v2\0")?,
            cu_memset_d8_async: resolve_symbol(&lib, b"cuMemsetD8Async\0")?,
            cu_stream_create: resolve_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: resolve_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: resolve_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_stream_begin_capture_v2: resolve_symbol(&lib, b"cuStreamBeginCapture_v2\0")?,
            cu_stream_end_capture: resolve_symbol(&lib, b"cuStreamEndCapture\0")?,
            cu_stream_is_capturing: resolve_symbol(&lib, b"cuStreamIsCapturing\0")?,
            cu_graph_instantiate_with_flags: resolve_symbol(&lib, b"cuGraphInstantiateWithFlags\0")?,
            cu_graph_launch: resolve_symbol(&lib, b"cuGraphLaunch\0")?,
            cu_graph_exec_destroy: resolve_symbol(&lib, b"cuGraphExecDestroy\0")?,
            cu_graph_destroy: resolve_symbol(&lib, b"cuGraphDestroy\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            cu_check((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            cu_check(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            cu_check(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            cu_check((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            let mut stream: CUstream = std::ptr::null_mut();
            if let Err(err) = cu_check(
                (fns.cu_stream_create)(&mut stream as *mut CUstream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            ) {
                let _ = (fns.cu_ctx_destroy_v2)(ctx);
                return Err(err);
            }
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
                stream: stream as usize,
            })
        }
    }

    /// Allocates `bytes` and enqueues a zero fill on the driver stream.
    pub fn alloc_zeroed(self: &Arc<Self>, bytes: usize) -> BackendResult<DeviceAllocation> {
        let allocation = self.alloc(bytes)?;
        if bytes != 0 {
            // SAFETY: Destination is a valid allocated device pointer; memset count is bounded by allocation size.
            unsafe {
                cu_check(
                    (self.fns.cu_memset_d8_async)(allocation.ptr, 0, bytes, self.stream_ptr()),
                    "cuMemsetD8Async",
                )?;
            }
        }
        Ok(allocation)
    }

    /// Allocates a buffer for `bytes` and copies them in, returning once the copy completed.
    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> BackendResult<DeviceAllocation> {
        let allocation = self.alloc(bytes.len())?;
        if !bytes.is_empty() {
            // SAFETY: Destination is a valid allocated device pointer and source host slice is
            // valid until the stream synchronisation below returns.
            unsafe {
                cu_check(
                    (self.fns.cu_memcpy_hto_d_async_v2)(
                        allocation.ptr,
                        bytes.as_ptr() as *const c_void,
                        bytes.len(),
                        self.stream_ptr(),
                    ),
                    "cuMemcpyHtoDAsync_v2",
                )?;
            }
            self.synchronize()?;
        }
        Ok(allocation)
    }

    /// Copies `bytes` bytes starting at `ptr` back to the host after all queued work.
    pub fn download(&self, ptr: CUdeviceptr, bytes: usize) -> BackendResult<Vec<u8>> {
        self.ensure_current()?;
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            // SAFETY: Source device pointer is valid for `bytes`; destination host buffer is
            // valid and writable until the synchronisation below returns.
            unsafe {
                cu_check(
                    (self.fns.cu_memcpy_dto_h_async_v2)(
                        out.as_mut_ptr() as *mut c_void,
                        ptr,
                        bytes,
                        self.stream_ptr(),
                    ),
                    "cuMemcpyDtoHAsync_v2",
                )?;
            }
        }
        self.synchronize()?;
        Ok(out)
    }

    /// Enqueues a device-to-device copy. Recorded instead of run while the stream captures.
    pub fn copy_device_to_device(
        &self,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        bytes: usize,
    ) -> BackendResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: src/dst pointers are valid CUDA allocations and byte range is provided by caller.
        unsafe {
            cu_check(
                (self.fns.cu_memcpy_dto_d_async_v2)(dst, src, bytes, self.stream_ptr()),
                "cuMemcpyDtoDAsync_v2",
            )?;
        }
        Ok(())
    }

    pub fn synchronize(&self) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: Stream is owned by this driver and valid until drop.
        unsafe {
            cu_check(
                (self.fns.cu_stream_synchronize)(self.stream_ptr()),
                "cuStreamSynchronize",
            )
        }
    }

    pub fn begin_capture(&self) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: Stream is owned by this driver; the mode is a valid CUstreamCaptureMode.
        unsafe {
            cu_check(
                (self.fns.cu_stream_begin_capture_v2)(
                    self.stream_ptr(),
                    CU_STREAM_CAPTURE_MODE_RELAXED,
                ),
                "cuStreamBeginCapture_v2",
            )
        }
    }

    /// Ends the capture on the driver stream and instantiates the recorded graph.
    pub fn end_capture(self: &Arc<Self>) -> BackendResult<GraphExec> {
        self.ensure_current()?;
        let mut graph: CUgraph = std::ptr::null_mut();
        // SAFETY: Stream is owned by this driver and `graph` is a valid out pointer.
        unsafe {
            cu_check(
                (self.fns.cu_stream_end_capture)(self.stream_ptr(), &mut graph as *mut CUgraph),
                "cuStreamEndCapture",
            )?;
        }
        let mut exec: CUgraphExec = std::ptr::null_mut();
        // SAFETY: `graph` was produced by the capture above; `exec` is a valid out pointer.
        let instantiated = unsafe {
            cu_check(
                (self.fns.cu_graph_instantiate_with_flags)(
                    &mut exec as *mut CUgraphExec,
                    graph,
                    0,
                ),
                "cuGraphInstantiateWithFlags",
            )
        };
        if let Err(err) = instantiated {
            // SAFETY: The graph is owned here and never instantiated.
            let _ = unsafe { (self.fns.cu_graph_destroy)(graph) };
            return Err(err);
        }
        Ok(GraphExec {
            driver: Arc::clone(self),
            graph: graph as usize,
            exec: exec as usize,
        })
    }

    pub fn is_capturing(&self) -> BackendResult<bool> {
        self.ensure_current()?;
        let mut status = CU_STREAM_CAPTURE_STATUS_NONE;
        // SAFETY: Stream is owned by this driver and `status` is a valid out pointer.
        unsafe {
            cu_check(
                (self.fns.cu_stream_is_capturing)(self.stream_ptr(), &mut status as *mut u32),
                "cuStreamIsCapturing",
            )?;
        }
        Ok(status != CU_STREAM_CAPTURE_STATUS_NONE)
    }

    /// Enqueues one replay of `graph` on the driver stream.
    pub fn launch_graph(&self, graph: &GraphExec) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: The executable graph is alive for the duration of the call.
        unsafe {
            cu_check(
                (self.fns.cu_graph_launch)(graph.exec as CUgraphExec, self.stream_ptr()),
                "cuGraphLaunch",
            )
        }
    }

    pub fn ensure_current(&self) -> BackendResult<()> {
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe {
            cu_check(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn alloc(self: &Arc<Self>, bytes: usize) -> BackendResult<DeviceAllocation> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation. Zero-byte requests are
        // rounded up so every buffer has a distinct address.
        unsafe {
            cu_check(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(DeviceAllocation {
            driver: Arc::clone(self),
            ptr,
            bytes,
        })
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }

    fn stream_ptr(&self) -> CUstream {
        self.stream as CUstream
    }
}

/// Driver library names, tried in order.
const DRIVER_LIBRARIES: [&str; 4] = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

fn open_driver_library() -> BackendResult<Library> {
    DRIVER_LIBRARIES
        .iter()
        // SAFETY: Opening the library runs no driver entry points.
        .find_map(|name| unsafe { Library::new(name) }.ok())
        .ok_or_else(|| {
            BackendError::execution(format!(
                "no CUDA driver library found among {}",
                DRIVER_LIBRARIES.join(", ")
            ))
        })
}

fn resolve_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: `T` is the driver API signature declared for `name` above.
    match unsafe { lib.get::<T>(name) } {
        Ok(symbol) => Ok(*symbol),
        Err(err) => Err(BackendError::execution(format!(
            "CUDA driver lacks {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))),
    }
}

fn cu_check(code: CUresult, op: &str) -> BackendResult<()> {
    match code {
        CUDA_SUCCESS => Ok(()),
        code => Err(BackendError::execution(format!("{op} returned CUresult {code}"))),
    }
}
